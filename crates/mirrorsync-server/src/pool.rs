//! Change-stream pool.
//!
//! Change streams are expensive (each may pin a store connection), so every
//! collection shares at most one active stream across all in-flight
//! operations. Operations register on the stream when they start and are
//! released a grace period after they finish, because change events can
//! arrive after the write that caused them returns. A stream whose reference
//! set is empty is closed and dropped from the index.
//!
//! # Concurrency Model
//!
//! - Index and per-stream state behind parking_lot mutexes, never held across `.await`
//! - Registration checks closing/closed under the stream's own lock
//! - Opening a stream is serialized per collection by an async lock, so two
//!   racing operations cannot both open one

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use mirrorsync_types::{ChangeEvent, OperationId, OperationType};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::store::{ChangeStream, Store};

/// Operation types a pooled stream observes.
pub const OBSERVED_OPERATIONS: &[OperationType] = &[OperationType::Update, OperationType::Replace];

#[derive(Debug, Default)]
struct StreamState {
    closing: bool,
    closed: bool,
    used_by: HashSet<OperationId>,
}

/// A change stream shared by the operations registered on it.
pub struct PooledStream {
    seq: u64,
    collection: String,
    inner: Arc<dyn ChangeStream>,
    state: Mutex<StreamState>,
}

impl PooledStream {
    fn new(seq: u64, collection: &str, inner: Arc<dyn ChangeStream>) -> Self {
        Self {
            seq,
            collection: collection.to_string(),
            inner,
            state: Mutex::new(StreamState::default()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Pool-local sequence number, for logs.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn reference_count(&self) -> usize {
        self.state.lock().used_by.len()
    }

    pub fn is_used_by(&self, op: OperationId) -> bool {
        self.state.lock().used_by.contains(&op)
    }

    /// Register `op` unless the stream is already on its way out.
    fn try_register(&self, op: OperationId) -> bool {
        let mut state = self.state.lock();
        if state.closing || state.closed {
            return false;
        }
        state.used_by.insert(op);
        true
    }

    fn deregister(&self, op: OperationId) {
        self.state.lock().used_by.remove(&op);
    }
}

/// Per-collection pool of shared change streams.
pub struct ChangeStreamPool {
    store: Arc<dyn Store>,
    streams: Mutex<HashMap<String, Vec<Arc<PooledStream>>>>,
    open_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    sweepers: Mutex<HashSet<String>>,
    grace: Duration,
    sweep_interval: Duration,
    next_seq: AtomicU64,
}

impl ChangeStreamPool {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            streams: Mutex::new(HashMap::new()),
            open_locks: DashMap::new(),
            sweepers: Mutex::new(HashSet::new()),
            grace: config.grace(),
            sweep_interval: config.sweep_interval(),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Register `op` on the collection's active stream, opening one if needed.
    pub async fn acquire(
        &self,
        collection: &str,
        op: OperationId,
    ) -> Result<Arc<PooledStream>, ServerError> {
        if let Some(stream) = self.register_on_active(collection, op) {
            return Ok(stream);
        }

        let lock = self
            .open_locks
            .entry(collection.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Someone may have opened one while we waited.
        if let Some(stream) = self.register_on_active(collection, op) {
            return Ok(stream);
        }

        let inner = self
            .store
            .watch(collection, OBSERVED_OPERATIONS)
            .await
            .map_err(|e| ServerError::BackingStoreUnavailable(e.to_string()))?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(PooledStream::new(seq, collection, inner));
        stream.try_register(op);
        self.streams
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(stream.clone());
        debug!(collection, stream = seq, operation_id = %op.short(), "change stream opened");
        Ok(stream)
    }

    fn register_on_active(&self, collection: &str, op: OperationId) -> Option<Arc<PooledStream>> {
        let index = self.streams.lock();
        let stream = index
            .get(collection)?
            .iter()
            .find(|s| s.try_register(op))?
            .clone();
        debug!(collection, stream = stream.seq, operation_id = %op.short(), "reusing change stream");
        Some(stream)
    }

    /// Release `op` from `stream` after the grace period.
    ///
    /// `listener` is cancelled at the same moment, ending the operation's
    /// event listener.
    pub fn schedule_release(
        self: &Arc<Self>,
        stream: Arc<PooledStream>,
        op: OperationId,
        listener: CancellationToken,
    ) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(pool.grace).await;
            listener.cancel();
            pool.release(&stream, op).await;
        });
    }

    /// Deregister `op` and close the stream if nobody else uses it.
    pub async fn release(&self, stream: &Arc<PooledStream>, op: OperationId) {
        stream.deregister(op);
        debug!(
            collection = %stream.collection,
            stream = stream.seq,
            operation_id = %op.short(),
            remaining = stream.reference_count(),
            "released change stream"
        );
        self.maybe_close(stream).await;
    }

    /// Close `stream` if it has no references and is not already closing.
    pub async fn maybe_close(&self, stream: &Arc<PooledStream>) {
        {
            let mut state = stream.state.lock();
            if !state.used_by.is_empty() || state.closing || state.closed {
                return;
            }
            state.closing = true;
        }

        if let Err(e) = stream.inner.close().await {
            warn!(collection = %stream.collection, stream = stream.seq, error = %e, "failed to close change stream");
        }
        stream.state.lock().closed = true;

        let mut index = self.streams.lock();
        if let Some(streams) = index.get_mut(&stream.collection) {
            streams.retain(|s| !Arc::ptr_eq(s, stream));
            if streams.is_empty() {
                index.remove(&stream.collection);
            }
        }
        debug!(collection = %stream.collection, stream = stream.seq, "change stream closed");
    }

    /// Start the collection's sweeper unless one is running.
    ///
    /// The sweeper tries [`maybe_close`](Self::maybe_close) on every indexed
    /// stream each tick and exits once the collection has none left.
    pub fn ensure_sweeper(self: &Arc<Self>, collection: &str) {
        if !self.sweepers.lock().insert(collection.to_string()) {
            return;
        }

        let pool = Arc::clone(self);
        let collection = collection.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.sweep_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let streams = {
                    let mut sweepers = pool.sweepers.lock();
                    let index = pool.streams.lock();
                    match index.get(&collection) {
                        Some(streams) if !streams.is_empty() => streams.clone(),
                        _ => {
                            sweepers.remove(&collection);
                            debug!(collection = %collection, "sweeper stopped");
                            return;
                        }
                    }
                };
                for stream in &streams {
                    pool.maybe_close(stream).await;
                }
            }
        });
    }

    /// The stream new operations on `collection` would join.
    pub fn active_stream(&self, collection: &str) -> Option<Arc<PooledStream>> {
        self.streams
            .lock()
            .get(collection)?
            .iter()
            .find(|s| !s.is_closing() && !s.is_closed())
            .cloned()
    }

    /// Streams currently indexed for `collection`, closing ones included.
    pub fn stream_count(&self, collection: &str) -> usize {
        self.streams.lock().get(collection).map_or(0, Vec::len)
    }

    pub fn has_sweeper(&self, collection: &str) -> bool {
        self.sweepers.lock().contains(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn pool(store: &Arc<MemoryStore>) -> Arc<ChangeStreamPool> {
        ChangeStreamPool::new(store.clone(), &ServerConfig::default())
    }

    #[tokio::test]
    async fn test_operations_share_one_stream() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool(&store);
        let (a, b) = (OperationId::new(), OperationId::new());

        let s1 = pool.acquire("posts", a).await.unwrap();
        let s2 = pool.acquire("posts", b).await.unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(s1.reference_count(), 2);
        assert_eq!(store.watch_calls(), 1);

        pool.release(&s1, a).await;
        assert!(!s1.is_closed());
        pool.release(&s2, b).await;
        assert!(s1.is_closed());
        assert_eq!(pool.stream_count("posts"), 0);
        assert_eq!(store.open_stream_count("posts"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_opens_once() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool(&store);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire("posts", OperationId::new()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.watch_calls(), 1);
        assert_eq!(pool.active_stream("posts").unwrap().reference_count(), 8);
    }

    #[tokio::test]
    async fn test_closed_stream_is_replaced() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool(&store);
        let a = OperationId::new();
        let s1 = pool.acquire("posts", a).await.unwrap();
        pool.release(&s1, a).await;

        let s2 = pool.acquire("posts", OperationId::new()).await.unwrap();
        assert!(!Arc::ptr_eq(&s1, &s2));
        assert_eq!(store.watch_calls(), 2);
    }

    #[tokio::test]
    async fn test_maybe_close_keeps_referenced_stream() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool(&store);
        let s = pool.acquire("posts", OperationId::new()).await.unwrap();
        pool.maybe_close(&s).await;
        assert!(!s.is_closing());
        assert_eq!(pool.stream_count("posts"), 1);
    }

    #[tokio::test]
    async fn test_acquire_failure_is_backing_store_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_watch_failure(true);
        let pool = pool(&store);
        let err = pool.acquire("posts", OperationId::new()).await;
        assert!(matches!(err, Err(ServerError::BackingStoreUnavailable(_))));
        assert_eq!(pool.stream_count("posts"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_waits_for_grace() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool(&store);
        let (a, b) = (OperationId::new(), OperationId::new());
        let (ta, tb) = (CancellationToken::new(), CancellationToken::new());

        let stream = pool.acquire("posts", a).await.unwrap();
        pool.acquire("posts", b).await.unwrap();
        pool.schedule_release(stream.clone(), a, ta.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.schedule_release(stream.clone(), b, tb.clone());

        tokio::time::sleep(Duration::from_millis(4_001)).await;
        assert!(ta.is_cancelled());
        assert!(!tb.is_cancelled());
        assert!(!stream.is_closed());
        assert!(stream.is_used_by(b));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(tb.is_cancelled());
        assert!(stream.is_closed());
        assert_eq!(pool.stream_count("posts"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_collection_empty() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool(&store);
        let a = OperationId::new();
        let stream = pool.acquire("posts", a).await.unwrap();
        pool.ensure_sweeper("posts");
        pool.ensure_sweeper("posts");
        assert!(pool.has_sweeper("posts"));

        // Still referenced: the sweeper leaves it alone
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert!(!stream.is_closed());

        // Dropped without going through release, so only the sweeper closes it
        stream.deregister(a);
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(stream.is_closed());

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(!pool.has_sweeper("posts"));
    }
}
