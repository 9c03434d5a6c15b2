//! Contains the Outbox, the durable buffer of notifications committed
//! atomically with the Domain Events that caused them.
//!
//! The Outbox decouples command handling from delivery: an accepted
//! command only enqueues its notifications, and the [Relay] drains them
//! towards the outside world at the pace of the consumer, with
//! at-least-once semantics. Consumers must therefore be idempotent;
//! the [Item::seq_nr] and [Item::correlation_id] values are stable
//! across redeliveries and can be used as deduplication keys.

use std::marker::PhantomData;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify::Listener;
use crate::version::SeqNr;

/// A notification enqueued in the Outbox, pending delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item<Id, N> {
    /// The position of the item in the global commit order. Stable
    /// across redeliveries.
    pub seq_nr: SeqNr,

    /// The id of the Event Stream whose commit enqueued this item.
    pub stream_id: Id,

    /// The id of the Domain Command whose commit enqueued this item.
    /// Stable across redeliveries.
    pub correlation_id: Uuid,

    /// The notification to deliver.
    pub notification: N,

    /// The instant the item was enqueued.
    pub created_at: DateTime<Utc>,
}

impl<Id, N> PartialEq for Item<Id, N>
where
    Id: PartialEq,
    N: PartialEq,
{
    /// Equality is based on the position of the item in the Outbox and
    /// its payload; the correlation id and enqueue time are disregarded.
    fn eq(&self, other: &Self) -> bool {
        self.seq_nr == other.seq_nr
            && self.stream_id == other.stream_id
            && self.notification == other.notification
    }
}

/// Driver-side interface to the Outbox storage.
#[async_trait]
pub trait Store<Id, N>: Send + Sync
where
    Id: Send + Sync,
    N: Send + Sync,
{
    /// The error type returned by the Outbox storage.
    type Error: Send + Sync;

    /// Streams the currently pending [Item]s, in
    /// [SeqNr][crate::version::SeqNr] order. The stream is finite: it
    /// ends once the pending items at the time of the call are exhausted.
    fn pending(&self) -> BoxStream<'_, Result<Item<Id, N>, Self::Error>>;

    /// Acknowledges delivery of the provided [Item]s: exactly those
    /// become invisible to future [Store::pending] scans.
    async fn mark_all_as_sent(&self, items: Vec<Item<Id, N>>) -> Result<(), Self::Error>;
}

/// The endless drain of the Outbox: an initial scan of the pending
/// [Item]s, then a re-scan on every commit wake-up.
///
/// The relay is pull-based: items are only read from storage as the
/// consumer demands them, so the drain rate is governed by the consumer.
/// Within one [Relay::stream] instance every item is yielded once; items
/// that are never [marked as sent][Store::mark_all_as_sent] are yielded
/// again, with identical sequence numbers, by the next instance -- which
/// is what makes delivery at-least-once across consumer restarts.
#[derive(Debug, Clone)]
pub struct Relay<Id, N, S, L> {
    store: S,
    listener: L,
    item: PhantomData<(Id, N)>,
}

impl<Id, N, S, L> Relay<Id, N, S, L>
where
    Id: Send + Sync + 'static,
    N: Send + Sync + 'static,
    S: Store<Id, N> + Clone + Send + Sync + 'static,
    S::Error: Send + Sync + 'static,
    L: Listener,
{
    /// Creates a new [Relay] over the provided Outbox storage, woken up
    /// by the provided [Listener].
    pub fn new(store: S, listener: L) -> Self {
        Self {
            store,
            listener,
            item: PhantomData,
        }
    }

    /// Opens the drain stream.
    pub fn stream(&self) -> BoxStream<'static, Result<Item<Id, N>, S::Error>> {
        // Subscribe to wake-ups before the first scan: commits performed
        // while the scan is running are buffered in the channel, and the
        // follow-up scan picks their items without waiting for another
        // commit.
        let mut wakeups = self.listener.listen();
        let store = self.store.clone();

        Box::pin(try_stream! {
            let mut cursor: SeqNr = 0;

            loop {
                {
                    let mut pending = store.pending();

                    while let Some(item) = pending.try_next().await? {
                        if item.seq_nr > cursor {
                            cursor = item.seq_nr;
                            yield item;
                        }
                    }
                }

                if wakeups.next().await.is_none() {
                    // The notification hub is gone: the backend is
                    // shutting down, so is this drain.
                    break;
                }

                tracing::trace!("outbox relay woken up, re-scanning pending items");
            }
        })
    }

    /// Acknowledges delivery of the provided [Item]s.
    ///
    /// See [Store::mark_all_as_sent].
    pub async fn mark_all_as_sent(&self, items: Vec<Item<Id, N>>) -> Result<(), S::Error> {
        self.store.mark_all_as_sent(items).await
    }
}
