//! Index-based blocking query against a local indexed store.
//!
//! The loop re-runs a caller-supplied query function until its index
//! passes the caller's watermark, blocking between rounds on the
//! wait-handles the function registered. Two deliberate heuristics keep
//! watches on sparse data from waking on every unrelated mutation: a
//! not-found round after another not-found round raises the watermark to
//! the current index, and (optionally) a round whose result hashes the
//! same as the previous one does too, so an unchanged value never
//! satisfies the index-advanced check.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use fxhash::FxHasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::watch_set::{WakeReason, WatchHandle, WatchSet};

/// Capability of the indexed store a blocking query runs against.
pub trait StateStore {
    /// Returns a handle fired on wholesale store replacement (snapshot
    /// restore); a blocked query returns immediately when it fires.
    fn abandon_handle(&self) -> WatchHandle;
}

/// Error returned by a query function and propagated to the caller
/// unchanged. Not-found is not an error: it is a `None` value in
/// [`QueryResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("query failed: {0}")]
pub struct QueryError(
    /// Human-readable cause.
    pub String,
);

impl QueryError {
    /// Creates a query error from any displayable cause.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One round's answer from a query function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse<T> {
    /// Index of the last mutation visible to the query.
    pub index: u64,
    /// The result, or `None` when the watched data does not exist.
    pub value: Option<T>,
}

/// Options for [`blocking_query`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Index the caller has already seen; 0 makes the query non-blocking.
    pub min_index: u64,
    /// Upper bound on one call's blocking time; zero waits indefinitely.
    pub max_wait: Duration,
    /// Raise the watermark past rounds whose result is structurally
    /// unchanged, so only real changes unblock the caller.
    pub suppress_spurious_wakeups: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            min_index: 0,
            max_wait: Duration::from_secs(5 * 60),
            suppress_spurious_wakeups: false,
        }
    }
}

pub(crate) fn result_hash<T: Hash>(value: &Option<T>) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Runs `query_fn` against the store until its index passes
/// `opts.min_index`, blocking between rounds on the wait-handles the
/// function registers.
///
/// Each round obtains a fresh store handle from `store_accessor` (the
/// store may have been replaced wholesale since the last round). Indexes
/// below 1 are normalized to 1 so a result can never re-trigger callers
/// that treat 0 as "nothing seen". A not-found result with
/// `opts.min_index == 0` returns immediately. When `max_wait` elapses, the
/// last-known response is returned without error; cancellation is
/// dropping the future.
///
/// # Errors
///
/// Propagates the first [`QueryError`] returned by `query_fn`.
pub async fn blocking_query<S, T, A, Q>(
    store_accessor: A,
    opts: &QueryOptions,
    mut query_fn: Q,
) -> Result<QueryResponse<T>, QueryError>
where
    S: StateStore,
    T: Hash,
    A: Fn() -> S,
    Q: FnMut(&mut WatchSet, &S) -> Result<QueryResponse<T>, QueryError>,
{
    let deadline = (!opts.max_wait.is_zero()).then(|| Instant::now() + opts.max_wait);
    let mut min_index = opts.min_index;
    let mut prev_not_found = false;
    let mut prev_hash: Option<u64> = None;

    loop {
        let store = store_accessor();
        let mut watches = WatchSet::new();
        let abandon = store.abandon_handle();
        watches.set_abandon(abandon.clone());

        let mut resp = query_fn(&mut watches, &store)?;
        if resp.index < 1 {
            resp.index = 1;
        }

        let not_found = resp.value.is_none();
        if not_found {
            if opts.min_index == 0 {
                // Never block a non-blocking query on data that does not
                // exist.
                return Ok(resp);
            }
            if prev_not_found {
                // Watching the root of a non-existent key wakes on every
                // unrelated mutation; stop re-reporting the same absence.
                min_index = min_index.max(resp.index);
            }
        }
        prev_not_found = not_found;

        if opts.suppress_spurious_wakeups {
            let hash = result_hash(&resp.value);
            if prev_hash == Some(hash) {
                min_index = min_index.max(resp.index);
            }
            prev_hash = Some(hash);
        }

        if resp.index > min_index {
            return Ok(resp);
        }

        match watches.wait(deadline).await {
            WakeReason::DeadlineElapsed | WakeReason::Abandoned => return Ok(resp),
            WakeReason::Data => {
                // A store-wide invalidation may race a data wakeup.
                if abandon.has_changed().unwrap_or(true) {
                    return Ok(resp);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::watch_set::Trigger;

    /// In-memory indexed store used across the crate's tests: one index
    /// stamped on every mutation, one trigger fired on every mutation, an
    /// abandon trigger fired on wholesale replacement.
    #[derive(Default)]
    pub(crate) struct MemStore {
        data: Mutex<BTreeMap<String, u64>>,
        index: AtomicU64,
        changed: Trigger,
        abandoned: Trigger,
    }

    impl MemStore {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn set(&self, key: &str, value: u64) -> u64 {
            let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
            self.data.lock().insert(key.to_string(), value);
            self.changed.fire();
            index
        }

        pub(crate) fn index(&self) -> u64 {
            self.index.load(Ordering::SeqCst)
        }

        pub(crate) fn read(&self, key: &str) -> (u64, Option<u64>) {
            (self.index(), self.data.lock().get(key).copied())
        }

        pub(crate) fn change_handle(&self) -> WatchHandle {
            self.changed.watch()
        }

        pub(crate) fn abandon(&self) {
            self.abandoned.fire();
        }
    }

    impl StateStore for Arc<MemStore> {
        fn abandon_handle(&self) -> WatchHandle {
            self.abandoned.watch()
        }
    }

    /// Query function reading one key and watching the whole store.
    pub(crate) fn read_key(
        key: &'static str,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut(&mut WatchSet, &Arc<MemStore>) -> Result<QueryResponse<u64>, QueryError> {
        move |watches, store| {
            calls.fetch_add(1, Ordering::SeqCst);
            watches.add(store.change_handle());
            let (index, value) = store.read(key);
            Ok(QueryResponse { index, value })
        }
    }

    fn accessor(store: &Arc<MemStore>) -> impl Fn() -> Arc<MemStore> {
        let store = Arc::clone(store);
        move || Arc::clone(&store)
    }

    fn opts(min_index: u64, max_wait_ms: u64) -> QueryOptions {
        QueryOptions {
            min_index,
            max_wait: Duration::from_millis(max_wait_ms),
            suppress_spurious_wakeups: false,
        }
    }

    // --- Non-blocking paths ---

    #[tokio::test]
    async fn test_not_found_with_zero_min_index_returns_immediately() {
        let store = MemStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        let resp = blocking_query(accessor(&store), &opts(0, 5000), read_key("web", calls))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(resp.value, None);
        assert_eq!(resp.index, 1);
    }

    #[tokio::test]
    async fn test_index_zero_normalized_to_one() {
        let store = MemStore::new();
        assert_eq!(store.index(), 0);
        let calls = Arc::new(AtomicUsize::new(0));

        let resp = blocking_query(accessor(&store), &opts(0, 5000), read_key("web", calls))
            .await
            .unwrap();
        assert_eq!(resp.index, 1);
    }

    #[tokio::test]
    async fn test_fresh_data_returns_without_blocking() {
        let store = MemStore::new();
        store.set("web", 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let resp = blocking_query(accessor(&store), &opts(0, 5000), read_key("web", Arc::clone(&calls)))
            .await
            .unwrap();
        assert_eq!(resp.value, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // --- Blocking paths ---

    #[tokio::test]
    async fn test_blocks_until_watched_data_changes() {
        let store = MemStore::new();
        let first = store.set("web", 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.set("web", 2);
            })
        };
        let resp = blocking_query(accessor(&store), &opts(first, 5000), read_key("web", calls))
            .await
            .unwrap();
        assert!(resp.index > first);
        assert_eq!(resp.value, Some(2));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_returns_last_known_without_error() {
        let store = MemStore::new();
        let index = store.set("web", 1);

        let start = Instant::now();
        let calls = Arc::new(AtomicUsize::new(0));
        let resp = blocking_query(accessor(&store), &opts(index, 30), read_key("web", calls))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(resp.index, index);
        assert_eq!(resp.value, Some(1));
    }

    // --- Not-found escalation ---

    #[tokio::test]
    async fn test_consecutive_not_found_rounds_keep_blocking() {
        let store = MemStore::new();
        store.set("other", 1);
        let calls = Arc::new(AtomicUsize::new(0));

        // Unrelated writes wake the root watch over and over; the
        // escalated watermark must swallow every one of them.
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..5 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    store.set("other", i);
                }
            })
        };

        let start = Instant::now();
        let resp = blocking_query(
            accessor(&store),
            &opts(1, 120),
            read_key("web", Arc::clone(&calls)),
        )
        .await
        .unwrap();
        // Only the deadline releases the caller, not the unrelated churn.
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(resp.value, None);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_not_found_resolves_when_key_appears() {
        let store = MemStore::new();
        let first = store.set("other", 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.set("other", 2);
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.set("web", 7);
            })
        };
        let resp = blocking_query(accessor(&store), &opts(first, 5000), read_key("web", calls))
            .await
            .unwrap();
        assert_eq!(resp.value, Some(7));
        writer.await.unwrap();
    }

    // --- Spurious-wakeup suppression ---

    #[tokio::test]
    async fn test_unchanged_result_suppressed_until_real_change() {
        let store = MemStore::new();
        store.set("web", 1);
        let min_index = store.index();
        let calls = Arc::new(AtomicUsize::new(0));

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                // Unrelated writes bump the index but leave "web" alone.
                for i in 0..3 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    store.set("other", i);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.set("web", 2);
            })
        };

        let options = QueryOptions {
            min_index,
            max_wait: Duration::from_secs(5),
            suppress_spurious_wakeups: true,
        };
        let resp = blocking_query(accessor(&store), &options, read_key("web", calls))
            .await
            .unwrap();
        // The caller only unblocks for the value that actually differs.
        assert_eq!(resp.value, Some(2));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_without_suppression_unchanged_result_returns() {
        let store = MemStore::new();
        store.set("web", 1);
        let min_index = store.index();
        let calls = Arc::new(AtomicUsize::new(0));

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.set("other", 1);
            })
        };
        let resp = blocking_query(
            accessor(&store),
            &opts(min_index, 5000),
            read_key("web", calls),
        )
        .await
        .unwrap();
        // Index advanced, value did not: without suppression that is
        // enough to release the caller.
        assert_eq!(resp.value, Some(1));
        assert!(resp.index > min_index);
        writer.await.unwrap();
    }

    // --- Errors and abandonment ---

    #[tokio::test]
    async fn test_query_error_propagates_immediately() {
        let store = MemStore::new();
        let result: Result<QueryResponse<u64>, _> =
            blocking_query(accessor(&store), &opts(5, 5000), |_watches, _store| {
                Err(QueryError::new("index corrupted"))
            })
            .await;
        assert_eq!(result.unwrap_err(), QueryError::new("index corrupted"));
    }

    #[tokio::test]
    async fn test_abandon_releases_blocked_query() {
        let store = MemStore::new();
        let index = store.set("web", 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let abandoner = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.abandon();
            })
        };
        let start = Instant::now();
        let resp = blocking_query(accessor(&store), &opts(index, 5000), read_key("web", calls))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(resp.value, Some(1));
        abandoner.await.unwrap();
    }
}
