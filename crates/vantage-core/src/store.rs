//! Store — maps many logical requests onto few materializers.
//!
//! Entries are keyed by a request fingerprint and created lazily, at most
//! once per fingerprint (double-checked construction). Every entry owns a
//! consumer task keeping its materializer current. Idle entries expire
//! after a TTL, tracked in a min-heap swept by a companion task; an entry
//! with outstanding `get`/`notify` callers is never evicted, and eviction
//! otherwise just drops the cache entry — a later identical request
//! rebuilds it transparently.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::consumer::{self, ConsumerHandle};
use crate::materializer::{Materializer, MaterializerError, QueryResult};
use crate::retry::RetryConfig;
use crate::source::{EventSource, SubscribeRequest, SurfacePolicy};
use crate::view::View;

/// Error returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request could not construct its view.
    #[error("failed to construct view: {0}")]
    Construction(String),

    /// The underlying materializer reported an error.
    #[error(transparent)]
    Materializer(#[from] MaterializerError),
}

/// Identity and query parameters of one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    /// Request type tag; part of the fingerprint.
    pub type_name: &'static str,
    /// Logical key being queried.
    pub key: String,
    /// Datacenter the data lives in.
    pub datacenter: String,
    /// Opaque ACL token; part of the fingerprint so callers with different
    /// visibility never share a view.
    pub token: String,
    /// Index the caller has already seen; the query blocks until passed.
    pub min_index: u64,
    /// Blocking-query timeout; zero means wait indefinitely.
    pub timeout: Duration,
}

impl CacheInfo {
    /// Deterministic entry key. Two requests with the same fingerprint
    /// must be interchangeable: same view construction, same filtering.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.type_name, self.datacenter, self.token, self.key
        )
    }
}

/// A logical request the store can serve.
///
/// Implementations translate one domain query shape into the engine's
/// generic pieces: a fingerprint, a view, and the subscription backend
/// that feeds it.
pub trait ViewRequest: Send + Sync + 'static {
    /// View aggregating this request's events.
    type View: View;

    /// Returns the request's identity and query parameters.
    fn cache_info(&self) -> CacheInfo;

    /// Constructs a fresh view for a new store entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Construction`] when the request cannot build
    /// its view.
    fn new_view(&self) -> Result<Self::View, StoreError>;

    /// Returns the backend this request subscribes through.
    fn source(&self) -> Arc<dyn EventSource<Event = <Self::View as View>::Event>>;

    /// Error-surfacing policy for this request's consumer; remote-backed
    /// requests default to absorbing one transient failure.
    fn surface_policy(&self) -> SurfacePolicy {
        SurfacePolicy::AfterRepeat
    }
}

/// Configuration for a [`Store`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Idle lifetime of an entry, refreshed on every access.
    pub entry_ttl: Duration,
    /// Interval between expiry sweeps in [`Store::run`].
    pub sweep_interval: Duration,
    /// Backoff configuration handed to every consumer task.
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(30),
            retry: RetryConfig {
                min_failures: 1,
                min_wait: Duration::ZERO,
                max_wait: Duration::from_secs(60),
                factor: Duration::from_secs(1),
                jitter_percent: 100,
            },
        }
    }
}

/// Atomic counters describing a store's activity.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Entries constructed (cache misses).
    pub entries_created: AtomicU64,
    /// Entries torn down by the expiry sweep.
    pub entries_evicted: AtomicU64,
    /// Notify tasks started.
    pub notify_tasks: AtomicU64,
}

impl StoreMetrics {
    /// Returns the number of entries constructed.
    #[must_use]
    pub fn entries_created(&self) -> u64 {
        self.entries_created.load(Ordering::Relaxed)
    }

    /// Returns the number of entries evicted.
    #[must_use]
    pub fn entries_evicted(&self) -> u64 {
        self.entries_evicted.load(Ordering::Relaxed)
    }

    /// Returns the number of notify tasks started.
    #[must_use]
    pub fn notify_tasks(&self) -> u64 {
        self.notify_tasks.load(Ordering::Relaxed)
    }
}

/// One delivered notify update.
#[derive(Debug)]
pub struct Update<T> {
    /// Correlation ID the notify call was registered with.
    pub correlation_id: String,
    /// Index of this delivery; strictly greater than the previous one for
    /// value updates.
    pub index: u64,
    /// The new value, or the error recorded on the materializer.
    pub result: Result<T, MaterializerError>,
}

struct StoreEntry<V: View> {
    materializer: Arc<Materializer<V>>,
    consumer: ConsumerHandle,
    expires_at: Arc<Mutex<Instant>>,
    requests: Arc<AtomicUsize>,
}

/// RAII lease marking an outstanding caller on an entry; while held, the
/// sweep will not evict the entry. Dropping it refreshes the TTL.
struct EntryLease {
    requests: Arc<AtomicUsize>,
    expires_at: Arc<Mutex<Instant>>,
    ttl: Duration,
}

impl EntryLease {
    fn acquire<V: View>(entry: &StoreEntry<V>, ttl: Duration) -> Self {
        entry.requests.fetch_add(1, Ordering::SeqCst);
        Self {
            requests: Arc::clone(&entry.requests),
            expires_at: Arc::clone(&entry.expires_at),
            ttl,
        }
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        *self.expires_at.lock() = Instant::now() + self.ttl;
        self.requests.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ExpiryEntry {
    expires_at: Instant,
    key: String,
}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at && self.key == other.key
    }
}
impl Eq for ExpiryEntry {}
impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Registry of materializers keyed by request fingerprint.
pub struct Store<R: ViewRequest> {
    entries: RwLock<FxHashMap<String, StoreEntry<R::View>>>,
    expiry: Mutex<BinaryHeap<Reverse<ExpiryEntry>>>,
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
}

impl<R: ViewRequest> Store<R> {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            expiry: Mutex::new(BinaryHeap::new()),
            config,
            metrics: Arc::new(StoreMetrics::default()),
        }
    }

    /// Returns the store's metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Blocking read: resolves the request's entry (creating it on first
    /// use), then waits until the materialized index passes the request's
    /// `min_index` or its timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Construction`] if a fresh view cannot be
    /// built, or the error recorded on the materializer.
    pub async fn get(
        &self,
        req: &R,
    ) -> Result<QueryResult<<R::View as View>::Value>, StoreError> {
        let info = req.cache_info();
        let (materializer, lease) = self.acquire(req, &info)?;
        let deadline = (!info.timeout.is_zero()).then(|| Instant::now() + info.timeout);
        let result = materializer.query(info.min_index, deadline).await;
        drop(lease);
        Ok(result?)
    }

    /// Starts a background task delivering an update every time the
    /// materialized index advances, beginning from index 0 so the current
    /// value is delivered immediately once materialized.
    ///
    /// The task holds the entry alive and runs until the receiver side of
    /// `tx` is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Construction`] if a fresh view cannot be
    /// built.
    pub fn notify(
        &self,
        req: &R,
        correlation_id: impl Into<String>,
        tx: mpsc::Sender<Update<<R::View as View>::Value>>,
    ) -> Result<(), StoreError> {
        let info = req.cache_info();
        let (materializer, lease) = self.acquire(req, &info)?;
        let correlation_id = correlation_id.into();
        self.metrics.notify_tasks.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let _lease = lease;
            let mut last_index = 0u64;
            loop {
                let result = tokio::select! {
                    () = tx.closed() => return,
                    result = materializer.query(last_index, None) => result,
                };
                let update = match result {
                    Ok(query_result) => {
                        if query_result.index <= last_index {
                            continue;
                        }
                        last_index = query_result.index;
                        Update {
                            correlation_id: correlation_id.clone(),
                            index: query_result.index,
                            result: Ok(query_result.value),
                        }
                    }
                    // The next query blocks until a fresh wakeup, so an
                    // unchanged error is not re-delivered in a tight loop.
                    Err(err) => Update {
                        correlation_id: correlation_id.clone(),
                        index: last_index,
                        result: Err(err),
                    },
                };
                if tx.send(update).await.is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    /// Runs the periodic expiry sweep until `shutdown` fires, then tears
    /// down every remaining entry.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_expired();
                    if evicted > 0 {
                        tracing::debug!(evicted, "expired idle store entries");
                    }
                }
            }
        }
        self.shutdown_all();
    }

    /// Pops due expiry records and evicts entries whose TTL has elapsed
    /// with no outstanding callers. Returns the number of entries evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        loop {
            // Pop the next due record without holding the heap lock while
            // touching the entry map.
            let key = {
                let mut heap = self.expiry.lock();
                match heap.peek() {
                    Some(Reverse(record)) if record.expires_at <= now => {
                        heap.pop().map(|Reverse(record)| record.key)
                    }
                    _ => None,
                }
            };
            let Some(key) = key else { break };

            let mut entries = self.entries.write();
            let Some(entry) = entries.get(&key) else {
                continue;
            };
            let expires_at = *entry.expires_at.lock();
            if entry.requests.load(Ordering::SeqCst) > 0 {
                // Outstanding caller: push the record out a full TTL.
                drop(entries);
                self.expiry.lock().push(Reverse(ExpiryEntry {
                    expires_at: now + self.config.entry_ttl,
                    key,
                }));
            } else if expires_at > now {
                // TTL was refreshed since the record was queued.
                drop(entries);
                self.expiry.lock().push(Reverse(ExpiryEntry { expires_at, key }));
            } else {
                let entry = entries.remove(&key);
                drop(entries);
                if let Some(entry) = entry {
                    entry.consumer.shutdown();
                    self.metrics.entries_evicted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(fingerprint = %key, "evicted idle store entry");
                }
                evicted += 1;
            }
        }
        evicted
    }

    /// Tears down every entry and its consumer task.
    pub fn shutdown_all(&self) {
        let entries = {
            let mut map = self.entries.write();
            std::mem::take(&mut *map)
        };
        for entry in entries.values() {
            entry.consumer.shutdown();
        }
        self.expiry.lock().clear();
    }

    /// Resolves the entry for `req`, constructing it on first use
    /// (double-checked), and returns the materializer plus a lease pinning
    /// the entry while the caller is attached.
    fn acquire(
        &self,
        req: &R,
        info: &CacheInfo,
    ) -> Result<(Arc<Materializer<R::View>>, EntryLease), StoreError> {
        let key = info.fingerprint();
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&key) {
                let lease = EntryLease::acquire(entry, self.config.entry_ttl);
                return Ok((Arc::clone(&entry.materializer), lease));
            }
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(&key) {
            let lease = EntryLease::acquire(entry, self.config.entry_ttl);
            return Ok((Arc::clone(&entry.materializer), lease));
        }

        let view = req.new_view()?;
        let materializer = Arc::new(Materializer::new(view));
        let subscribe = SubscribeRequest {
            key: info.key.clone(),
            datacenter: info.datacenter.clone(),
            token: info.token.clone(),
            index: 0,
        };
        let consumer = consumer::spawn(
            Arc::clone(&materializer),
            req.source(),
            subscribe,
            req.surface_policy(),
            self.config.retry.clone(),
        );

        let expires_at = Instant::now() + self.config.entry_ttl;
        let entry = StoreEntry {
            materializer: Arc::clone(&materializer),
            consumer,
            expires_at: Arc::new(Mutex::new(expires_at)),
            requests: Arc::new(AtomicUsize::new(0)),
        };
        let lease = EntryLease::acquire(&entry, self.config.entry_ttl);
        entries.insert(key.clone(), entry);
        drop(entries);

        self.expiry.lock().push(Reverse(ExpiryEntry {
            expires_at,
            key: key.clone(),
        }));
        self.metrics.entries_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(fingerprint = %key, "created store entry");
        Ok((materializer, lease))
    }
}

impl<R: ViewRequest> Drop for Store<R> {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
