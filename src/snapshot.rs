//! Contains the Snapshot Store, the cache of materialised Aggregate
//! states used to shorten Event Stream replays.
//!
//! Snapshots are pure caches: every value stored here can be rebuilt by
//! folding the Journal from scratch, so all the operations in this module
//! are best-effort -- a failing or missing snapshot only costs a longer
//! replay, never correctness.
//!
//! Two implementations are provided:
//!
//! * [InMemory], a bounded LRU cache;
//! * [Buffered], an LRU cache with write-behind persistence to a backing
//!   [Store], flushing dirty entries when either enough of them pile up
//!   or the oldest one grows past a configured age, coalesced per Event
//!   Stream.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::version::Version;

/// A materialised Aggregate state at a known [Version].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    /// The Aggregate state with all events up to [Snapshot::version]
    /// applied.
    pub state: S,

    /// The version of the Event Stream the state was materialised at.
    pub version: Version,
}

/// Interface to a Snapshot Store.
///
/// All operations are best-effort: callers log and carry on when they
/// fail, falling back to a full Event Stream replay.
#[async_trait]
pub trait Store<Id, S>: Send + Sync {
    /// Returns the cached [Snapshot] for the specified Event Stream,
    /// if any.
    async fn get(&self, id: &Id) -> anyhow::Result<Option<Snapshot<S>>>;

    /// Caches the provided [Snapshot] for the specified Event Stream,
    /// replacing any previous one.
    async fn put(&self, id: Id, snapshot: Snapshot<S>) -> anyhow::Result<()>;

    /// Forces any buffered entries down to durable storage. A no-op for
    /// purely in-memory implementations.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory [Store] implementation, backed by a bounded LRU cache.
pub struct InMemory<Id, S>
where
    Id: Hash + Eq,
{
    cache: Arc<Mutex<LruCache<Id, Snapshot<S>>>>,
}

impl<Id, S> InMemory<Id, S>
where
    Id: Hash + Eq,
{
    /// Creates a new [InMemory] Store retaining up to `max_in_mem`
    /// snapshots.
    pub fn new(max_in_mem: usize) -> Self {
        let capacity = NonZeroUsize::new(max_in_mem).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }
}

impl<Id, S> Clone for InMemory<Id, S>
where
    Id: Hash + Eq,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

#[async_trait]
impl<Id, S> Store<Id, S> for InMemory<Id, S>
where
    Id: Hash + Eq + Send + Sync,
    S: Clone + Send + Sync,
{
    async fn get(&self, id: &Id) -> anyhow::Result<Option<Snapshot<S>>> {
        Ok(self.cache.lock().get(id).cloned())
    }

    async fn put(&self, id: Id, snapshot: Snapshot<S>) -> anyhow::Result<()> {
        self.cache.lock().put(id, snapshot);
        Ok(())
    }
}

/// Configuration values for a [Buffered] Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of snapshots retained in memory.
    pub max_in_mem: usize,

    /// Number of dirty entries that forces a flush to the backing Store.
    pub max_buffer: usize,

    /// Maximum age of the oldest dirty entry before a flush is forced.
    pub max_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_in_mem: 1000,
            max_buffer: 100,
            max_wait: Duration::from_secs(60),
        }
    }
}

struct DirtyBuffer<Id, S> {
    entries: HashMap<Id, Snapshot<S>>,
    since: Option<Instant>,
}

struct Inner<Id, S, B>
where
    Id: Hash + Eq,
{
    mem: Mutex<LruCache<Id, Snapshot<S>>>,
    dirty: Mutex<DirtyBuffer<Id, S>>,
    backing: B,
    max_buffer: usize,
    max_wait: Duration,
    wakeup: Notify,
}

impl<Id, S, B> Inner<Id, S, B>
where
    Id: Hash + Eq + Clone + Send + Sync,
    S: Clone + Send + Sync,
    B: Store<Id, S>,
{
    /// Writes every dirty entry to the backing Store. Entries are
    /// coalesced per Event Stream by construction: the dirty buffer only
    /// retains the latest snapshot per id.
    async fn flush(&self) -> anyhow::Result<()> {
        let entries: Vec<(Id, Snapshot<S>)> = {
            let mut dirty = self.dirty.lock();
            dirty.since = None;
            dirty.entries.drain().collect()
        };

        for (id, snapshot) in entries {
            self.backing.put(id, snapshot).await?;
        }

        Ok(())
    }
}

/// Guard aborting the background flusher once the last handle to the
/// [Buffered] Store is dropped.
struct FlusherGuard(tokio::task::JoinHandle<()>);

impl Drop for FlusherGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// [Store] implementation layering an in-memory LRU cache over a backing
/// [Store], with write-behind persistence.
///
/// Reads always observe the freshest in-memory value; writes are buffered
/// and flushed to the backing Store when [Config::max_buffer] entries are
/// dirty or the oldest dirty entry is older than [Config::max_wait],
/// whichever comes first.
///
/// Dropping the last handle aborts the background flusher: call
/// [Store::flush] (or [Backend::shutdown][crate::backend::Backend::shutdown])
/// first to avoid losing buffered entries.
pub struct Buffered<Id, S, B>
where
    Id: Hash + Eq,
{
    inner: Arc<Inner<Id, S, B>>,
    flusher: Arc<FlusherGuard>,
}

impl<Id, S, B> Clone for Buffered<Id, S, B>
where
    Id: Hash + Eq,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            flusher: self.flusher.clone(),
        }
    }
}

impl<Id, S, B> Buffered<Id, S, B>
where
    Id: Hash + Eq + Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    B: Store<Id, S> + 'static,
{
    /// Creates a new [Buffered] Store over the provided backing [Store],
    /// spawning the background flusher on the current Tokio runtime.
    pub fn new(backing: B, config: Config) -> Self {
        let capacity = NonZeroUsize::new(config.max_in_mem).unwrap_or(NonZeroUsize::MIN);

        let inner = Arc::new(Inner {
            mem: Mutex::new(LruCache::new(capacity)),
            dirty: Mutex::new(DirtyBuffer {
                entries: HashMap::new(),
                since: None,
            }),
            backing,
            max_buffer: config.max_buffer.max(1),
            max_wait: config.max_wait,
            wakeup: Notify::new(),
        });

        let flusher = {
            let inner = inner.clone();

            tokio::spawn(async move {
                loop {
                    let deadline = inner
                        .dirty
                        .lock()
                        .since
                        .map(|since| since + inner.max_wait);

                    match deadline {
                        None => inner.wakeup.notified().await,
                        Some(deadline) => {
                            let now = Instant::now();

                            if now < deadline {
                                tokio::time::sleep(deadline - now).await;
                            } else if let Err(error) = inner.flush().await {
                                tracing::warn!(
                                    %error,
                                    "failed to flush snapshots to the backing store",
                                );
                            }
                        },
                    }
                }
            })
        };

        Self {
            inner,
            flusher: Arc::new(FlusherGuard(flusher)),
        }
    }
}

#[async_trait]
impl<Id, S, B> Store<Id, S> for Buffered<Id, S, B>
where
    Id: Hash + Eq + Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    B: Store<Id, S> + 'static,
{
    async fn get(&self, id: &Id) -> anyhow::Result<Option<Snapshot<S>>> {
        if let Some(snapshot) = self.inner.mem.lock().get(id) {
            return Ok(Some(snapshot.clone()));
        }

        if let Some(snapshot) = self.inner.dirty.lock().entries.get(id) {
            return Ok(Some(snapshot.clone()));
        }

        match self.inner.backing.get(id).await? {
            None => Ok(None),
            Some(snapshot) => {
                self.inner.mem.lock().put(id.clone(), snapshot.clone());
                Ok(Some(snapshot))
            },
        }
    }

    async fn put(&self, id: Id, snapshot: Snapshot<S>) -> anyhow::Result<()> {
        self.inner.mem.lock().put(id.clone(), snapshot.clone());

        let flush_now = {
            let mut dirty = self.inner.dirty.lock();
            dirty.entries.insert(id, snapshot);

            if dirty.since.is_none() {
                dirty.since = Some(Instant::now());
                self.inner.wakeup.notify_one();
            }

            dirty.entries.len() >= self.inner.max_buffer
        };

        if flush_now {
            self.inner.flush().await?;
        }

        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Backing store decorator counting the writes that reach it.
    struct Counting<T> {
        store: T,
        writes: AtomicUsize,
    }

    impl<T> Counting<T> {
        fn new(store: T) -> Arc<Self> {
            Arc::new(Self {
                store,
                writes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl<Id, S, T> Store<Id, S> for Counting<T>
    where
        Id: Send + Sync + 'static,
        S: Send + Sync + 'static,
        T: Store<Id, S>,
    {
        async fn get(&self, id: &Id) -> anyhow::Result<Option<Snapshot<S>>> {
            self.store.get(id).await
        }

        async fn put(&self, id: Id, snapshot: Snapshot<S>) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.store.put(id, snapshot).await
        }
    }

    #[async_trait]
    impl<Id, S, T> Store<Id, S> for Arc<T>
    where
        Id: Send + Sync + 'static,
        S: Send + Sync + 'static,
        T: Store<Id, S>,
    {
        async fn get(&self, id: &Id) -> anyhow::Result<Option<Snapshot<S>>> {
            self.as_ref().get(id).await
        }

        async fn put(&self, id: Id, snapshot: Snapshot<S>) -> anyhow::Result<()> {
            self.as_ref().put(id, snapshot).await
        }
    }

    fn snapshot(version: Version) -> Snapshot<u64> {
        Snapshot {
            state: version * 10,
            version,
        }
    }

    #[tokio::test]
    async fn in_memory_store_evicts_least_recently_used_entries() {
        let store = InMemory::<&'static str, u64>::new(2);

        store.put("a", snapshot(1)).await.unwrap();
        store.put("b", snapshot(2)).await.unwrap();
        store.put("c", snapshot(3)).await.unwrap();

        assert_eq!(None, store.get(&"a").await.unwrap());
        assert_eq!(Some(snapshot(2)), store.get(&"b").await.unwrap());
        assert_eq!(Some(snapshot(3)), store.get(&"c").await.unwrap());
    }

    #[tokio::test]
    async fn buffered_store_flushes_once_enough_entries_are_dirty() {
        let backing = Counting::new(InMemory::<&'static str, u64>::new(10));
        let store = Buffered::new(
            backing.clone(),
            Config {
                max_in_mem: 10,
                max_buffer: 2,
                max_wait: Duration::from_secs(60),
            },
        );

        store.put("a", snapshot(1)).await.unwrap();
        assert_eq!(0, backing.writes.load(Ordering::SeqCst));

        store.put("b", snapshot(2)).await.unwrap();
        assert_eq!(2, backing.writes.load(Ordering::SeqCst));

        assert_eq!(Some(snapshot(1)), backing.get(&"a").await.unwrap());
        assert_eq!(Some(snapshot(2)), backing.get(&"b").await.unwrap());
    }

    #[tokio::test]
    async fn buffered_store_coalesces_writes_per_stream() {
        let backing = Counting::new(InMemory::<&'static str, u64>::new(10));
        let store = Buffered::new(
            backing.clone(),
            Config {
                max_in_mem: 10,
                max_buffer: 100,
                max_wait: Duration::from_secs(60),
            },
        );

        store.put("a", snapshot(1)).await.unwrap();
        store.put("a", snapshot(2)).await.unwrap();
        store.flush().await.unwrap();

        // Only the latest version per stream reaches the backing store.
        assert_eq!(1, backing.writes.load(Ordering::SeqCst));
        assert_eq!(Some(snapshot(2)), backing.get(&"a").await.unwrap());
    }

    #[tokio::test]
    async fn buffered_store_flushes_after_the_oldest_entry_grows_stale() {
        let backing = Counting::new(InMemory::<&'static str, u64>::new(10));
        let store = Buffered::new(
            backing.clone(),
            Config {
                max_in_mem: 10,
                max_buffer: 100,
                max_wait: Duration::from_millis(20),
            },
        );

        store.put("a", snapshot(1)).await.unwrap();
        assert_eq!(0, backing.writes.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(1, backing.writes.load(Ordering::SeqCst));
        assert_eq!(Some(snapshot(1)), backing.get(&"a").await.unwrap());
    }

    #[tokio::test]
    async fn buffered_store_reads_through_to_the_backing_store() {
        let backing = InMemory::<&'static str, u64>::new(10);
        backing.put("a", snapshot(7)).await.unwrap();

        let store = Buffered::new(backing.clone(), Config::default());

        assert_eq!(Some(snapshot(7)), store.get(&"a").await.unwrap());
    }

    #[tokio::test]
    async fn buffered_store_reads_see_the_freshest_value() {
        let backing = InMemory::<&'static str, u64>::new(10);
        backing.put("a", snapshot(1)).await.unwrap();

        let store = Buffered::new(backing.clone(), Config::default());
        store.put("a", snapshot(5)).await.unwrap();

        // The dirty value wins over the stale backing one.
        assert_eq!(Some(snapshot(5)), store.get(&"a").await.unwrap());
    }
}
