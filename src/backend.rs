//! Contains the [Backend] type, wiring the command-handling pipeline
//! together over a storage [Driver]: snapshot store, repository, command
//! handler and outbox relay, with a single [Config] for all tunables.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;

use crate::handler::EventSourced;
use crate::model::Model;
use crate::repository::Repository;
use crate::{command, handler, journal, notify, outbox, snapshot};

/// Configuration values for a [Backend].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of retries performed when a commit hits a version
    /// conflict with a concurrent writer.
    pub max_retry: u32,

    /// Base delay of the exponential backoff between retries: attempt
    /// `i` waits `retry_initial_delay * 2^i`.
    pub retry_initial_delay: Duration,

    /// Whether to keep an in-memory cache of processed command ids to
    /// skip duplicates without a storage round-trip.
    pub cached: bool,

    /// Capacity of the processed-commands cache.
    pub command_cache_size: usize,

    /// Whether the command id of a rejected command is recorded in the
    /// processed-commands cache.
    ///
    /// Off by default: re-submitting a rejected command re-evaluates it
    /// and reports the same rejection again. When enabled, a retry is
    /// skipped and reported as successful instead.
    pub record_rejected_commands: bool,

    /// Configuration of the snapshot store.
    pub snapshots: snapshot::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retry: 5,
            retry_initial_delay: Duration::from_secs(2),
            cached: true,
            command_cache_size: 100,
            record_rejected_commands: false,
            snapshots: snapshot::Config::default(),
        }
    }
}

/// The full storage interface consumed by a [Backend], provided by a
/// single driver value: Journal reads and commits, Outbox access and the
/// notification feeds.
///
/// Implemented out of the box by the
/// [in-memory driver][crate::inmemory::Store]; database-backed drivers
/// implement the same capability traits over their own storage.
pub trait Driver<M>:
    journal::Reader<M::Id, M::Event>
    + journal::Committer<M::Id, M::Event, M::Notification>
    + outbox::Store<M::Id, M::Notification>
    + notify::Listener
    + notify::Watcher<M::Id>
    + Clone
where
    M: Model,
{
}

impl<T, M> Driver<M> for T
where
    M: Model,
    T: journal::Reader<M::Id, M::Event>
        + journal::Committer<M::Id, M::Event, M::Notification>
        + outbox::Store<M::Id, M::Notification>
        + notify::Listener
        + notify::Watcher<M::Id>
        + Clone,
{
}

/// An event-sourced command-handling backend for a single [Model].
///
/// The backend is a scoped resource: acquire it with [Backend::new] (or
/// [Backend::with_snapshots] for write-behind snapshot persistence), and
/// release it with [Backend::shutdown] to await any in-flight snapshot
/// flushes.
pub struct Backend<M, D, S>
where
    M: Model,
{
    handler: EventSourced<M, D, S>,
    driver: D,
    snapshots: S,
}

impl<M, D> Backend<M, D, snapshot::InMemory<M::Id, M::State>>
where
    M: Model,
    D: Driver<M> + Send + Sync + 'static,
    <D as journal::Reader<M::Id, M::Event>>::Error:
        std::error::Error + Send + Sync + 'static,
    <D as outbox::Store<M::Id, M::Notification>>::Error: Send + Sync + 'static,
{
    /// Creates a new [Backend] with a purely in-memory snapshot store.
    pub fn new(model: M, driver: D, config: Config) -> Self {
        let snapshots = snapshot::InMemory::new(config.snapshots.max_in_mem);

        Self::with_snapshots(model, driver, snapshots, config)
    }
}

impl<M, D, S> Backend<M, D, S>
where
    M: Model,
    D: Driver<M> + Send + Sync + 'static,
    <D as journal::Reader<M::Id, M::Event>>::Error:
        std::error::Error + Send + Sync + 'static,
    <D as outbox::Store<M::Id, M::Notification>>::Error: Send + Sync + 'static,
    S: snapshot::Store<M::Id, M::State> + Clone,
{
    /// Creates a new [Backend] using the provided snapshot store, e.g. a
    /// [snapshot::Buffered] one for write-behind persistence.
    pub fn with_snapshots(model: M, driver: D, snapshots: S, config: Config) -> Self {
        let commands: Arc<dyn command::Store> = if config.cached {
            Arc::new(command::Lru::new(config.command_cache_size))
        } else {
            Arc::new(command::Disabled)
        };

        // Construction order matters: the snapshot store feeds the
        // repository, which feeds the handler.
        let handler = EventSourced::new(model, driver.clone(), snapshots.clone(), commands, &config);

        Self {
            handler,
            driver,
            snapshots,
        }
    }

    /// Returns the Command Handler of this [Backend].
    pub fn handler(&self) -> &EventSourced<M, D, S> {
        &self.handler
    }

    /// Processes a Domain Command. Shorthand for
    /// [`handler().process(..)`][EventSourced::process].
    pub async fn process(
        &self,
        command: command::Envelope<M::Id, M::Command>,
    ) -> Result<command::Outcome<M::Rejection>, handler::Error> {
        self.handler.process(command).await
    }

    /// Returns the [Repository] reconstructing the Aggregate states of
    /// this [Backend].
    pub fn repository(&self) -> &Repository<M, D, S> {
        self.handler.repository()
    }

    /// Returns a handle to the underlying storage driver, for direct
    /// Journal reads.
    pub fn journal(&self) -> &D {
        &self.driver
    }

    /// Returns a new Outbox [Relay][outbox::Relay], draining the pending
    /// notifications as commits wake it up.
    pub fn outbox(&self) -> outbox::Relay<M::Id, M::Notification, D, D> {
        outbox::Relay::new(self.driver.clone(), self.driver.clone())
    }

    /// Opens the feed of the Event Stream ids touched by commits, for
    /// read-model projectors.
    pub fn changes(&self) -> BoxStream<'static, M::Id> {
        self.driver.changes()
    }

    /// Opens the coalesced commit wake-up feed.
    pub fn updates(&self) -> BoxStream<'static, ()> {
        self.driver.listen()
    }

    /// Releases the [Backend], awaiting any in-flight snapshot flushes.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.snapshots.flush().await
    }
}
