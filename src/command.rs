//! Module containing support for Domain [Command][Envelope]s.
//!
//! Following the Domain-driven Design definition, a Command expresses the
//! intent of an Actor (e.g. a Customer, a User, a System, etc.) to modify
//! the state of the system in some way.
//!
//! Commands are addressed to a single Event Stream and carry a unique id,
//! which doubles as the idempotency key: handling the same command
//! envelope twice must leave the system in the same state as handling it
//! once. The [Store] trait and its [Lru] implementation provide the
//! processed-commands cache used by the
//! [EventSourced][crate::handler::EventSourced] handler to skip
//! duplicates cheaply; the Journal's own unique constraint on the command
//! id remains the authoritative guard.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::decision::NonEmpty;
use crate::message;

/// A Domain Command addressed to a specific Event Stream.
///
/// The envelope id is generated when the command enters the system and is
/// used as the idempotency key for the whole processing pipeline.
#[derive(Debug, Clone)]
pub struct Envelope<Id, T>
where
    T: message::Message,
{
    /// Unique identifier of the command, used as idempotency key.
    pub id: Uuid,

    /// The instant the command entered the system.
    pub time: DateTime<Utc>,

    /// The id of the Event Stream the command is addressed to.
    pub address: Id,

    /// The command payload.
    pub message: T,

    /// Optional metadata to provide additional context to the command.
    pub metadata: message::Metadata,
}

impl<Id, T> Envelope<Id, T>
where
    T: message::Message,
{
    /// Creates a new command [Envelope] addressed to the specified Event
    /// Stream, with a freshly generated id.
    pub fn new(address: Id, message: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            time: Utc::now(),
            address,
            message,
            metadata: message::Metadata::default(),
        }
    }

    /// Overrides the envelope id.
    ///
    /// Use it to carry an idempotency key assigned by an upstream system,
    /// or to resubmit the very same command.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Adds a new entry in the command [Metadata][message::Metadata].
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// The business outcome of handling a Domain Command: either the command
/// went through (accepted or ineffective), or it was rejected for the
/// returned reasons.
///
/// Rejections are values, not errors: infrastructure failures travel on
/// the error channel of the handler instead.
pub type Outcome<R> = Result<(), NonEmpty<R>>;

/// A software component able to handle [Command][Envelope]s of a certain
/// type addressed to a certain kind of Event Stream.
#[async_trait]
pub trait Handler<Id, T, R>: Send + Sync
where
    T: message::Message,
{
    /// The error type returned by the Handler while handling a Command.
    type Error: Send + Sync;

    /// Handles a [Command][Envelope] and reports its business [Outcome],
    /// or an error if the handling could not complete.
    async fn handle(&self, command: Envelope<Id, T>) -> Result<Outcome<R>, Self::Error>;
}

/// A cache of already-processed command ids.
///
/// Implementations are free to forget entries (the cache is bounded): a
/// miss only costs a re-evaluation, which the Journal's idempotency
/// constraint makes harmless.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns true if the specified command id is known to have been
    /// processed already.
    async fn contains(&self, id: &Uuid) -> bool;

    /// Records the specified command id as processed.
    async fn add(&self, id: Uuid);
}

/// Bounded [Store] implementation keeping the most recently processed
/// command ids in memory.
///
/// Eviction follows insertion order: checking for an id with
/// [Store::contains] does not refresh it.
#[derive(Debug)]
pub struct Lru {
    cache: Mutex<LruCache<Uuid, ()>>,
}

impl Lru {
    /// Creates a new cache retaining up to `capacity` command ids.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl Store for Lru {
    async fn contains(&self, id: &Uuid) -> bool {
        // NOTE: peek, not get -- the idempotency check runs on every
        // command, and a read must not keep an old id artificially fresh.
        self.cache.lock().peek(id).is_some()
    }

    async fn add(&self, id: Uuid) {
        self.cache.lock().put(id, ());
    }
}

/// No-op [Store] implementation, used when the processed-commands cache
/// is disabled: every command goes through the full evaluation path.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

#[async_trait]
impl Store for Disabled {
    async fn contains(&self, _id: &Uuid) -> bool {
        false
    }

    async fn add(&self, _id: Uuid) {}
}
