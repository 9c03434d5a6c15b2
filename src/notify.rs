//! Module containing the notification channels used to wake up the
//! consumers of the system: the [Outbox][crate::outbox] relay and any
//! read-model projector following the Journal.
//!
//! Two feeds are exposed:
//!
//! * [Watcher::changes], yielding the id of every Event Stream touched by
//!   a commit -- useful for projectors that maintain per-stream state;
//! * [Listener::listen], a coalesced unit tick for consumers that only
//!   need to know *something* was committed and re-scan on their own,
//!   like the Outbox relay.
//!
//! Both feeds are wake-up channels, not data channels: a slow consumer
//! may miss intermediate items, and is expected to catch up by reading
//! the Journal or the Outbox from its own cursor.

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_DEFAULT_CAP: usize = 128;

/// Component yielding a wake-up tick whenever a commit is performed,
/// regardless of the Event Stream it touched.
pub trait Listener: Send + Sync {
    /// Opens an endless stream of wake-up ticks.
    ///
    /// Ticks are coalesced: receiving one means "at least one commit
    /// happened since the last tick you observed".
    fn listen(&self) -> BoxStream<'static, ()>;
}

/// Component yielding the id of every Event Stream touched by a commit.
pub trait Watcher<Id>: Send + Sync {
    /// Opens an endless stream of the ids of the Event Streams being
    /// committed to, in commit order.
    ///
    /// A consumer that lags too far behind may miss ids; the gap is
    /// reported through a log line, and the consumer is expected to
    /// resynchronise by reading the Journal from its last known
    /// [SeqNr][crate::version::SeqNr].
    fn changes(&self) -> BoxStream<'static, Id>;
}

/// In-process broadcast hub implementing [Listener] and [Watcher],
/// used by the in-memory storage driver.
///
/// Storage drivers backed by an external database would implement the
/// same traits over their own notification primitive (e.g. `LISTEN` /
/// `NOTIFY`).
#[derive(Debug, Clone)]
pub struct Hub<Id> {
    tx: broadcast::Sender<Id>,
}

impl<Id> Default for Hub<Id>
where
    Id: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(CHANNEL_DEFAULT_CAP)
    }
}

impl<Id> Hub<Id>
where
    Id: Clone + Send + 'static,
{
    /// Creates a new [Hub] with the specified broadcast channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);

        Self { tx }
    }

    /// Publishes the id of an Event Stream that has just been committed
    /// to.
    ///
    /// Publishing never fails: if no consumer is currently subscribed,
    /// the tick is simply dropped.
    pub fn publish(&self, id: Id) {
        let _ = self.tx.send(id);
    }
}

impl<Id> Watcher<Id> for Hub<Id>
where
    Id: Clone + Send + Sync + 'static,
{
    fn changes(&self) -> BoxStream<'static, Id> {
        let rx = self.tx.subscribe();

        BroadcastStream::new(rx)
            .filter_map(|result| async move {
                match result {
                    Ok(id) => Some(id),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "changes feed lagged, stream ids were dropped");
                        None
                    },
                }
            })
            .boxed()
    }
}

impl<Id> Listener for Hub<Id>
where
    Id: Clone + Send + Sync + 'static,
{
    fn listen(&self) -> BoxStream<'static, ()> {
        let rx = self.tx.subscribe();

        // A lagged receiver still produces a tick: for wake-up purposes,
        // missing an item and receiving an item are the same signal.
        BroadcastStream::new(rx).map(|_| ()).boxed()
    }
}
