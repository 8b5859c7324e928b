//! Change notification layered on the blocking query.
//!
//! [`notify`] spawns a background task that re-runs a blocking query with
//! spurious-wakeup suppression always on and pushes an update through a
//! channel only on real progress — a returned index strictly above the
//! last delivered one — or on a real error. Failed rounds are paced by the
//! shared [`Waiter`](vantage_core::retry::Waiter); the task exits silently
//! when the receiver is dropped or the handle shut down.

use std::hash::Hash;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use vantage_core::retry::{RetryConfig, RetryConfigError, Waiter};

use crate::query::{blocking_query, QueryError, QueryOptions, QueryResponse, StateStore};
use crate::watch_set::WatchSet;

/// One delivered notification.
#[derive(Debug)]
pub struct NotifyUpdate<T> {
    /// Correlation ID the notify call was registered with.
    pub correlation_id: String,
    /// Index of this delivery; strictly greater than the previous one for
    /// value updates.
    pub index: u64,
    /// The (possibly absent) value, or the round's error.
    pub result: Result<Option<T>, QueryError>,
}

/// Error returned before a notify task starts.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The update channel's receiver was already dropped.
    #[error("update channel closed before notify started")]
    ChannelClosed,

    /// The retry configuration pacing failed rounds is inconsistent.
    #[error("invalid retry configuration: {0}")]
    Retry(#[from] RetryConfigError),
}

/// Lifecycle handle for a spawned notify task.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct NotifyHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl NotifyHandle {
    /// Signals the task to stop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Returns `true` once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals stop and waits for the task to exit.
    pub async fn join(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NotifyHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Spawns a task delivering an update through `tx` whenever the queried
/// data actually changes.
///
/// `opts.min_index` is the starting watermark; suppression is forced on
/// regardless of the passed value so unchanged results never produce a
/// delivery. A round returning index 0 with no error is treated as a
/// misbehaving query and paced like a failure.
///
/// # Errors
///
/// Fails fast with [`NotifyError`] when the update channel is already
/// closed or `retry` is inconsistent; nothing is spawned in that case.
pub fn notify<S, T, A, Q>(
    correlation_id: impl Into<String>,
    store_accessor: A,
    mut query_fn: Q,
    tx: mpsc::Sender<NotifyUpdate<T>>,
    opts: QueryOptions,
    retry: RetryConfig,
) -> Result<NotifyHandle, NotifyError>
where
    S: StateStore + Send + 'static,
    T: Hash + Send + 'static,
    A: Fn() -> S + Send + Sync + 'static,
    Q: FnMut(&mut WatchSet, &S) -> Result<QueryResponse<T>, QueryError> + Send + 'static,
{
    if tx.is_closed() {
        return Err(NotifyError::ChannelClosed);
    }
    retry.validate()?;

    let correlation_id = correlation_id.into();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut opts = QueryOptions {
        suppress_spurious_wakeups: true,
        ..opts
    };

    let task = tokio::spawn(async move {
        let mut waiter = Waiter::new(retry);
        let mut last_delivered = 0u64;
        let mut last_hash: Option<u64> = None;
        loop {
            let round = tokio::select! {
                _ = stop_rx.wait_for(|stop| *stop) => return,
                () = tx.closed() => return,
                round = blocking_query(&store_accessor, &opts, &mut query_fn) => round,
            };
            match round {
                Ok(resp) if resp.index == 0 => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        "blocking query returned index 0; pacing retry"
                    );
                    if waiter.wait(&mut stop_rx).await.is_err() {
                        return;
                    }
                }
                Ok(resp) => {
                    waiter.reset();
                    opts.min_index = resp.index;
                    // The per-call suppression state resets between rounds,
                    // so mutations landing in the gap would otherwise
                    // re-deliver an unchanged value.
                    let hash = crate::query::result_hash(&resp.value);
                    if resp.index > last_delivered && last_hash != Some(hash) {
                        last_delivered = resp.index;
                        last_hash = Some(hash);
                        let update = NotifyUpdate {
                            correlation_id: correlation_id.clone(),
                            index: resp.index,
                            result: Ok(resp.value),
                        };
                        if tx.send(update).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let update = NotifyUpdate {
                        correlation_id: correlation_id.clone(),
                        index: last_delivered,
                        result: Err(err),
                    };
                    if tx.send(update).await.is_err() {
                        return;
                    }
                    if waiter.wait(&mut stop_rx).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(NotifyHandle {
        stop_tx,
        task: Some(task),
    })
}
