//! Contains the in-memory storage driver, backed by a thread-safe
//! [`HashMap`], implementing the whole storage interface consumed by the
//! crate: [journal::Reader], [journal::Committer], [outbox::Store] and
//! the [notify] feeds.
//!
//! The driver honours the same atomicity contract expected from any
//! external storage: a [commit][journal::Committer::commit] makes the
//! Domain Events, the Outbox notifications and the command-id record
//! visible together, under a single write lock.
//!
//! Useful for testing purposes, or for applications that do not require
//! durability.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{iter, BoxStream, StreamExt};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::version::{Check, ConflictError, SeqNr};
use crate::{event, journal, message, notify, outbox};

struct Backend<Id, Evt, N>
where
    Evt: message::Message,
{
    streams: HashMap<Id, Vec<event::Persisted<Id, Evt>>>,
    outbox: Vec<outbox::Item<Id, N>>,
    command_ids: HashSet<Uuid>,
    next_seq_nr: SeqNr,
}

impl<Id, Evt, N> Default for Backend<Id, Evt, N>
where
    Evt: message::Message,
{
    fn default() -> Self {
        Self {
            streams: HashMap::default(),
            outbox: Vec::default(),
            command_ids: HashSet::default(),
            next_seq_nr: 1,
        }
    }
}

struct Inner<Id, Evt, N>
where
    Evt: message::Message,
{
    backend: RwLock<Backend<Id, Evt, N>>,
    hub: notify::Hub<Id>,
}

/// In-memory implementation of the whole storage interface, backed by a
/// thread-safe [`HashMap`].
///
/// Cloning the value is cheap and returns a handle to the same storage.
pub struct Store<Id, Evt, N>
where
    Evt: message::Message,
{
    inner: Arc<Inner<Id, Evt, N>>,
}

impl<Id, Evt, N> Clone for Store<Id, Evt, N>
where
    Evt: message::Message,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Id, Evt, N> Default for Store<Id, Evt, N>
where
    Id: Clone + Send + 'static,
    Evt: message::Message,
{
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: RwLock::new(Backend::default()),
                hub: notify::Hub::default(),
            }),
        }
    }
}

impl<Id, Evt, N> journal::Reader<Id, Evt> for Store<Id, Evt, N>
where
    Id: Clone + Eq + Hash + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
    N: Send + Sync,
{
    type Error = Infallible;

    fn stream(
        &self,
        id: &Id,
        select: event::VersionSelect,
    ) -> event::Stream<'_, Id, Evt, Self::Error> {
        let backend = self.inner.backend.read();

        let events = backend
            .streams
            .get(id)
            .cloned()
            .unwrap_or_default() // NOTE: the new Vec is empty, so there will be no memory allocation!
            .into_iter()
            .filter(move |evt| match select {
                event::VersionSelect::All => true,
                event::VersionSelect::From(v) => evt.version >= v,
                event::VersionSelect::To(v) => evt.version <= v,
            });

        iter(events).map(Ok).boxed()
    }

    fn stream_all(&self, select: event::SeqNrSelect) -> event::Stream<'_, Id, Evt, Self::Error> {
        let backend = self.inner.backend.read();

        let mut events: Vec<event::Persisted<Id, Evt>> = backend
            .streams
            .values()
            .flatten()
            .filter(|evt| match select {
                event::SeqNrSelect::All => true,
                event::SeqNrSelect::From(seq_nr) => evt.seq_nr >= seq_nr,
            })
            .cloned()
            .collect();

        // The global stream is ordered by commit order.
        events.sort_by_key(|evt| evt.seq_nr);

        iter(events).map(Ok).boxed()
    }
}

#[async_trait]
impl<Id, Evt, N> journal::Committer<Id, Evt, N> for Store<Id, Evt, N>
where
    Id: Clone + Eq + Hash + Send + Sync + 'static,
    Evt: message::Message + Clone + Send + Sync,
    N: Send + Sync,
{
    async fn commit(
        &self,
        commit: journal::Commit<Id, Evt, N>,
    ) -> Result<journal::Committed, journal::CommitError> {
        let journal::Commit {
            stream_id,
            command_id,
            time,
            expected,
            events,
            notifications,
        } = commit;

        let committed = {
            let mut backend = self.inner.backend.write();

            if backend.command_ids.contains(&command_id) {
                return Err(journal::CommitError::DuplicateCommand(command_id));
            }

            let last_version = backend
                .streams
                .get(&stream_id)
                .and_then(|events| events.last())
                .map(|event| event.version)
                .unwrap_or_default();

            if !events.is_empty() {
                if let Check::MustBe(expected) = expected {
                    if last_version != expected {
                        return Err(journal::CommitError::Conflict(ConflictError {
                            expected,
                            actual: last_version,
                        }));
                    }
                }
            }

            let mut next_seq_nr = backend.next_seq_nr;
            let mut version = last_version;

            let mut persisted: Vec<event::Persisted<Id, Evt>> = Vec::with_capacity(events.len());

            for envelope in events {
                version += 1;

                persisted.push(event::Persisted {
                    stream_id: stream_id.clone(),
                    id: Uuid::new_v4(),
                    time,
                    seq_nr: next_seq_nr,
                    version,
                    event: envelope,
                });

                next_seq_nr += 1;
            }

            // Outbox items take their sequence numbers right after the
            // events of the same commit.
            for notification in notifications {
                backend.outbox.push(outbox::Item {
                    seq_nr: next_seq_nr,
                    stream_id: stream_id.clone(),
                    correlation_id: command_id,
                    notification,
                    created_at: time,
                });

                next_seq_nr += 1;
            }

            backend
                .streams
                .entry(stream_id.clone())
                .or_default()
                .append(&mut persisted);

            backend.command_ids.insert(command_id);

            let last_seq_nr = next_seq_nr - 1;
            backend.next_seq_nr = next_seq_nr;

            journal::Committed {
                version,
                last_seq_nr,
            }
        };

        self.inner.hub.publish(stream_id);

        Ok(committed)
    }
}

#[async_trait]
impl<Id, Evt, N> outbox::Store<Id, N> for Store<Id, Evt, N>
where
    Id: Clone + Eq + Hash + Send + Sync,
    Evt: message::Message + Send + Sync,
    N: Clone + Send + Sync,
{
    type Error = Infallible;

    fn pending(&self) -> BoxStream<'_, Result<outbox::Item<Id, N>, Self::Error>> {
        let mut items = self.inner.backend.read().outbox.clone();
        items.sort_by_key(|item| item.seq_nr);

        iter(items).map(Ok).boxed()
    }

    async fn mark_all_as_sent(
        &self,
        items: Vec<outbox::Item<Id, N>>,
    ) -> Result<(), Self::Error> {
        let sent: HashSet<SeqNr> = items.iter().map(|item| item.seq_nr).collect();

        self.inner
            .backend
            .write()
            .outbox
            .retain(|item| !sent.contains(&item.seq_nr));

        Ok(())
    }
}

impl<Id, Evt, N> notify::Listener for Store<Id, Evt, N>
where
    Id: Clone + Send + Sync + 'static,
    Evt: message::Message + Send + Sync,
    N: Send + Sync,
{
    fn listen(&self) -> BoxStream<'static, ()> {
        self.inner.hub.listen()
    }
}

impl<Id, Evt, N> notify::Watcher<Id> for Store<Id, Evt, N>
where
    Id: Clone + Send + Sync + 'static,
    Evt: message::Message + Send + Sync,
    N: Send + Sync,
{
    fn changes(&self) -> BoxStream<'static, Id> {
        self.inner.hub.changes()
    }
}
