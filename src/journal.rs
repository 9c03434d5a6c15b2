//! Contains the interface to the Journal, the append-only log of Domain
//! Events that is the source of truth of the system.
//!
//! The Journal is split in two capabilities, following the read/write
//! separation of the storage drivers implementing it:
//!
//! * [Reader], streaming committed Domain Events back into the
//!   application, either per Event Stream or across all of them in
//!   global commit order;
//! * [Committer], the single transactional write: Domain Events, the
//!   [Outbox][crate::outbox] notifications they caused and the id of the
//!   command that caused them are made durable together, or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{event, message, version};

/// Interface used to stream committed Domain Events from the Journal
/// back to the application.
pub trait Reader<Id, Evt>: Send + Sync
where
    Id: Send + Sync,
    Evt: message::Message + Send + Sync,
{
    /// The error type returned by the Journal when streaming fails.
    type Error: Send + Sync;

    /// Opens the Event Stream with the specified id, yielding the
    /// selected slice of its Domain Events in [Version][version::Version]
    /// order.
    fn stream(
        &self,
        id: &Id,
        select: event::VersionSelect,
    ) -> event::Stream<'_, Id, Evt, Self::Error>;

    /// Opens the global Event Stream, yielding the selected slice of all
    /// committed Domain Events in [SeqNr][version::SeqNr] order,
    /// regardless of the Event Stream they belong to.
    fn stream_all(&self, select: event::SeqNrSelect) -> event::Stream<'_, Id, Evt, Self::Error>;
}

/// The transactional unit handed to a [Committer]: everything in it
/// becomes durable atomically.
#[derive(Debug, Clone)]
pub struct Commit<Id, Evt, N>
where
    Evt: message::Message,
{
    /// The id of the Event Stream the events are appended to.
    pub stream_id: Id,

    /// The id of the Domain Command that caused this commit, recorded
    /// for idempotency: committing the same command id twice fails with
    /// [CommitError::DuplicateCommand].
    pub command_id: Uuid,

    /// The instant of the commit, stamped on every event and
    /// notification it carries.
    pub time: DateTime<Utc>,

    /// The expectation on the current stream [Version][version::Version],
    /// checked when the commit carries events.
    pub expected: version::Check,

    /// The Domain Events to append, in order. May be empty for a commit
    /// that only delivers notifications.
    pub events: Vec<event::Envelope<Evt>>,

    /// The notifications to enqueue in the [Outbox][crate::outbox],
    /// in order.
    pub notifications: Vec<N>,
}

/// Confirmation of a successful [Committer::commit].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    /// The new [Version][version::Version] of the Event Stream. Unchanged
    /// from the previous one if the commit carried no events.
    pub version: version::Version,

    /// The highest [SeqNr][version::SeqNr] assigned by this commit.
    pub last_seq_nr: version::SeqNr,
}

/// All possible error types returned by [`Committer::commit`].
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Error returned when the commit carries Domain Events and the
    /// Event Stream is not at the expected [Version][version::Version].
    #[error("failed to commit new domain events: {0}")]
    Conflict(#[from] version::ConflictError),

    /// Error returned when a commit for the same command id has already
    /// been performed. The original commit is untouched.
    #[error("command {0} has already been committed")]
    DuplicateCommand(Uuid),

    /// Error returned when the underlying storage has encountered an error.
    #[error("failed to commit, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Interface used to perform the single transactional write of the
/// system.
///
/// Implementations must guarantee that the Domain Events, the
/// [Outbox][crate::outbox] notifications and the command id record of a
/// [Commit] become visible together: a reader can never observe the
/// events of a commit without its notifications, or vice versa.
#[async_trait]
pub trait Committer<Id, Evt, N>: Send + Sync
where
    Id: Send + Sync,
    Evt: message::Message + Send + Sync,
    N: Send + Sync,
{
    /// Makes the provided [Commit] durable, atomically.
    async fn commit(&self, commit: Commit<Id, Evt, N>) -> Result<Committed, CommitError>;
}

impl<Id, Evt, N> Commit<Id, Evt, N>
where
    Evt: message::Message,
{
    /// Creates a new [Commit] for the specified Event Stream and command
    /// id, stamped with the current time.
    pub fn new(stream_id: Id, command_id: Uuid) -> Self {
        Self {
            stream_id,
            command_id,
            time: Utc::now(),
            expected: version::Check::Any,
            events: Vec::new(),
            notifications: Vec::new(),
        }
    }

    /// Sets the expectation on the current stream version.
    #[must_use]
    pub fn expecting(mut self, check: version::Check) -> Self {
        self.expected = check;
        self
    }

    /// Sets the Domain Events carried by the commit.
    #[must_use]
    pub fn with_events(mut self, events: Vec<event::Envelope<Evt>>) -> Self {
        self.events = events;
        self
    }

    /// Sets the notifications carried by the commit.
    #[must_use]
    pub fn with_notifications(mut self, notifications: Vec<N>) -> Self {
        self.notifications = notifications;
        self
    }
}
