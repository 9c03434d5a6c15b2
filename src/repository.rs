//! Contains the [Repository], which reconstructs the current state of an
//! Aggregate from its [Snapshot][crate::snapshot::Snapshot] and the tail
//! of its Event Stream.
//!
//! Reconstruction distinguishes two outcomes, expressed by
//! [AggregateState]: a [Valid][AggregateState::Valid] state with all
//! events applied cleanly, or a [Conflicted][AggregateState::Conflicted]
//! one when a committed event can no longer be applied -- the Event
//! Stream contains corrupted or unexpected data. Conflicts are values,
//! not errors: only transport failures from the Journal travel on the
//! error channel.

use std::marker::PhantomData;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::decision::NonEmpty;
use crate::model::Model;
use crate::snapshot::{self, Snapshot};
use crate::version::Version;
use crate::{event, journal};

/// The reconstructed state of an Aggregate instance.
pub enum AggregateState<Id, M>
where
    M: Model,
{
    /// All committed events up to `version` have been applied cleanly.
    Valid {
        /// The materialised Aggregate state.
        state: M::State,

        /// The version of the last event applied, or 0 for an empty
        /// Event Stream.
        version: Version,
    },

    /// Applying a committed event failed: the Event Stream is corrupted
    /// from that event onwards, and the Aggregate refuses any further
    /// command until the stream is repaired.
    Conflicted {
        /// The last state that could be materialised cleanly.
        last: M::State,

        /// The version of the last event applied cleanly.
        version: Version,

        /// The committed event that could not be applied.
        on_event: event::Persisted<Id, M::Event>,

        /// The reasons reported by [Model::transition].
        errors: NonEmpty<M::Rejection>,
    },
}

// NOTE: hand-written implementations, as deriving would constrain the
// Model carrier type itself rather than its associated types.

impl<Id, M> std::fmt::Debug for AggregateState<Id, M>
where
    M: Model,
    Id: std::fmt::Debug,
    M::State: std::fmt::Debug,
    M::Event: std::fmt::Debug,
    M::Rejection: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateState::Valid { state, version } => f
                .debug_struct("Valid")
                .field("state", state)
                .field("version", version)
                .finish(),
            AggregateState::Conflicted {
                last,
                version,
                on_event,
                errors,
            } => f
                .debug_struct("Conflicted")
                .field("last", last)
                .field("version", version)
                .field("on_event", on_event)
                .field("errors", errors)
                .finish(),
        }
    }
}

impl<Id, M> Clone for AggregateState<Id, M>
where
    M: Model,
    Id: Clone,
    M::Event: Clone,
    M::Rejection: Clone,
{
    fn clone(&self) -> Self {
        match self {
            AggregateState::Valid { state, version } => AggregateState::Valid {
                state: state.clone(),
                version: *version,
            },
            AggregateState::Conflicted {
                last,
                version,
                on_event,
                errors,
            } => AggregateState::Conflicted {
                last: last.clone(),
                version: *version,
                on_event: on_event.clone(),
                errors: errors.clone(),
            },
        }
    }
}

impl<Id, M> PartialEq for AggregateState<Id, M>
where
    M: Model,
    Id: PartialEq,
    M::State: PartialEq,
    M::Event: PartialEq,
    M::Rejection: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                AggregateState::Valid { state, version },
                AggregateState::Valid {
                    state: other_state,
                    version: other_version,
                },
            ) => state == other_state && version == other_version,
            (
                AggregateState::Conflicted {
                    last,
                    version,
                    on_event,
                    errors,
                },
                AggregateState::Conflicted {
                    last: other_last,
                    version: other_version,
                    on_event: other_on_event,
                    errors: other_errors,
                },
            ) => {
                last == other_last
                    && version == other_version
                    && on_event == other_on_event
                    && errors == other_errors
            },
            _ => false,
        }
    }
}

impl<Id, M> AggregateState<Id, M>
where
    M: Model,
{
    /// Returns the version of the last cleanly applied event.
    pub fn version(&self) -> Version {
        match self {
            AggregateState::Valid { version, .. } => *version,
            AggregateState::Conflicted { version, .. } => *version,
        }
    }

    /// Returns the last cleanly materialised state.
    pub fn state(&self) -> &M::State {
        match self {
            AggregateState::Valid { state, .. } => state,
            AggregateState::Conflicted { last, .. } => last,
        }
    }

    /// Returns true if all committed events have been applied cleanly.
    pub fn is_valid(&self) -> bool {
        matches!(self, AggregateState::Valid { .. })
    }
}

/// Reconstructs [AggregateState]s by folding Event Streams from a
/// [journal::Reader] over cached [Snapshot]s.
pub struct Repository<M, J, S>
where
    M: Model,
{
    journal: J,
    snapshots: S,
    model: PhantomData<M>,
}

impl<M, J, S> Clone for Repository<M, J, S>
where
    M: Model,
    J: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            journal: self.journal.clone(),
            snapshots: self.snapshots.clone(),
            model: PhantomData,
        }
    }
}

impl<M, J, S> Repository<M, J, S>
where
    M: Model,
    J: journal::Reader<M::Id, M::Event>,
    J::Error: Send + Sync,
    S: snapshot::Store<M::Id, M::State>,
{
    /// Creates a new [Repository] over the provided [journal::Reader]
    /// and [snapshot::Store].
    pub fn new(journal: J, snapshots: S) -> Self {
        Self {
            journal,
            snapshots,
            model: PhantomData,
        }
    }

    /// Returns the current [AggregateState] of the specified Aggregate
    /// instance.
    ///
    /// The state is folded from the cached [Snapshot] (if any) plus the
    /// tail of the Event Stream; after a successful full fold, the
    /// refreshed snapshot is written back, best-effort.
    ///
    /// # Errors
    ///
    /// Only transport errors from the Journal are returned; a failing
    /// [Model::transition] is reported as a
    /// [Conflicted][AggregateState::Conflicted] state instead.
    pub async fn get(&self, id: &M::Id) -> Result<AggregateState<M::Id, M>, J::Error> {
        let snapshot = self.snapshots.get(id).await.unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to read snapshot, replaying the full event stream");
            None
        });

        let (mut state, mut version) = match snapshot {
            Some(Snapshot { state, version }) => (state, version),
            None => (M::initial(), 0),
        };

        let snapshot_version = version;

        let select = match version {
            0 => event::VersionSelect::All,
            v => event::VersionSelect::From(v + 1),
        };

        {
            let mut stream = self.journal.stream(id, select);

            while let Some(persisted) = stream.try_next().await? {
                match M::transition(&state, &persisted.event.message) {
                    Ok(next) => {
                        state = next;
                        version = persisted.version;
                    },
                    Err(errors) => {
                        // The stream is corrupted from this event onwards:
                        // stop folding, later events can never make the
                        // state valid again.
                        return Ok(AggregateState::Conflicted {
                            last: state,
                            version,
                            on_event: persisted,
                            errors,
                        });
                    },
                }
            }
        }

        if version > snapshot_version {
            let refreshed = Snapshot {
                state: state.clone(),
                version,
            };

            if let Err(error) = self.snapshots.put(id.clone(), refreshed).await {
                tracing::warn!(%error, "failed to write snapshot back");
            }
        }

        Ok(AggregateState::Valid { state, version })
    }

    /// Streams the history of the specified Aggregate instance: one
    /// [AggregateState] per committed event, in version order.
    ///
    /// The stream ends after yielding the first
    /// [Conflicted][AggregateState::Conflicted] state, or at the end of
    /// the Event Stream. Each call opens a fresh stream from the start
    /// of history.
    pub fn history<'a>(
        &'a self,
        id: &M::Id,
    ) -> BoxStream<'a, Result<AggregateState<M::Id, M>, J::Error>>
    where
        J::Error: 'a,
        M: 'a,
    {
        let mut stream = self.journal.stream(id, event::VersionSelect::All);

        Box::pin(try_stream! {
            let mut state = M::initial();
            let mut version: Version = 0;

            while let Some(persisted) = stream.try_next().await? {
                match M::transition(&state, &persisted.event.message) {
                    Ok(next) => {
                        state = next;
                        version = persisted.version;

                        yield AggregateState::Valid {
                            state: state.clone(),
                            version,
                        };
                    },
                    Err(errors) => {
                        yield AggregateState::Conflicted {
                            last: state.clone(),
                            version,
                            on_event: persisted,
                            errors,
                        };

                        break;
                    },
                }
            }
        })
    }
}
