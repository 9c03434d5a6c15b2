//! Module `event` contains types and abstractions helpful for working
//! with Domain Events.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{message, version};

/// An Event is a [Message][message::Message] carrying the information about a Domain Event,
/// an occurrence in the system lifetime that is relevant for the Domain
/// that is being implemented.
pub type Envelope<T> = message::Envelope<T>;

/// An [Event][Envelope] that has been committed to the Journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persisted<Id, Evt>
where
    Evt: message::Message,
{
    /// The id of the Event Stream the committed Event belongs to.
    pub stream_id: Id,

    /// Unique identifier of this Event record.
    pub id: Uuid,

    /// The instant the commit carrying this Event was performed.
    pub time: DateTime<Utc>,

    /// The position of the Event in the global commit order, across all
    /// Event Streams.
    ///
    /// Check the [SeqNr][version::SeqNr] type documentation for more info.
    pub seq_nr: version::SeqNr,

    /// The version of the Event Stream when this Event has been recorded.
    ///
    /// This value is used for optimistic concurrency checks, to avoid
    /// data races in parallel command evaluations.
    ///
    /// Check the [Version][version::Version] type and module documentation for more info.
    pub version: version::Version,

    /// The actual Domain Event carried by this envelope.
    pub event: Envelope<Evt>,
}

impl<Id, Evt> PartialEq for Persisted<Id, Evt>
where
    Id: PartialEq,
    Evt: message::Message + PartialEq,
{
    /// Equality is based on the position of the Event in the Journal and
    /// its payload; the record id and commit time are disregarded, the
    /// same way [Envelope] equality disregards metadata.
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id
            && self.seq_nr == other.seq_nr
            && self.version == other.version
            && self.event == other.event
    }
}

/// Specifies the slice of the Event Stream to select when streaming
/// events from a [journal::Reader][crate::journal::Reader].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelect {
    /// Selects all [Event][Envelope]s in the Event Stream.
    All,

    /// Selects all [Event][Envelope]s starting from (and including) the
    /// specified [Version][version::Version].
    From(version::Version),

    /// Selects all [Event][Envelope]s up to (and including) the
    /// specified [Version][version::Version].
    To(version::Version),
}

/// Specifies the slice of the global Event Stream to select when
/// streaming events across all Event Streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqNrSelect {
    /// Selects every committed [Event][Envelope].
    All,

    /// Selects all [Event][Envelope]s starting from (and including) the
    /// specified [SeqNr][version::SeqNr].
    From(version::SeqNr),
}

/// Stream is a stream of [Persisted] Domain Events.
pub type Stream<'a, Id, Evt, Err> = BoxStream<'a, Result<Persisted<Id, Evt>, Err>>;
