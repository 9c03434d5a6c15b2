//! Contains the types necessary for Optimistic Locking through versioning,
//! and for the global ordering of committed Domain Events.

/// A version used for Optimistic Locking.
///
/// Every Event Stream starts at version 0 (no events committed yet) and
/// each committed Domain Event increases it by 1, with no gaps. The
/// [crate::handler::EventSourced] command handler uses it to detect
/// concurrent writers on the same stream.
pub type Version = u64;

/// A sequence number assigned to each committed Domain Event, unique and
/// strictly increasing over commit order across *all* Event Streams.
///
/// Where [Version] orders the events of a single stream, the sequence
/// number orders the whole Journal, and is the cursor used by
/// [crate::outbox] consumers and catch-up readers.
pub type SeqNr = u64;

/// Used to set the expectation on the current [Version] of an Event Stream
/// when committing new Domain Events to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Disables any Optimistic Locking check: the events are appended
    /// at whatever the current stream version happens to be.
    Any,

    /// Expects the Event Stream to be exactly at the specified [Version].
    ///
    /// A commit carrying this check fails with a [ConflictError] if
    /// another writer has appended to the stream in the meantime.
    MustBe(Version),
}

/// This error is returned by a function when a version conflict error has
/// been detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("conflict error detected, expected version was: {expected}, found: {actual}")]
pub struct ConflictError {
    /// The [Version] value that was expected when calling the function that failed.
    pub expected: Version,

    /// The actual [Version] value, which mismatch caused this error.
    pub actual: Version,
}
