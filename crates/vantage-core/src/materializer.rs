//! Materializer — owns one view's live state and its blocking-query surface.
//!
//! A materializer serializes view updates coming from exactly one consumer
//! task and answers index-based blocking reads from any number of
//! concurrent callers. Wakeup uses a `tokio::sync::watch` generation
//! channel: queriers subscribe *before* reading state under the lock, so
//! the check-then-wait window cannot miss an update, and a single
//! `send_modify` wakes every currently blocked caller while later
//! subscribers observe fresh state.
//!
//! # Lock discipline
//!
//! The internal mutex is held only for O(1) state transitions and the
//! view's (assumed fast) `apply`/`value` calls — never across an await.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::source::SourceError;
use crate::view::{View, ViewError};

/// Error recorded on, or returned from, a materializer.
#[derive(Debug, Clone, Error)]
pub enum MaterializerError {
    /// The view rejected an update batch.
    #[error(transparent)]
    View(#[from] ViewError),

    /// The subscription feeding this materializer failed.
    #[error(transparent)]
    Stream(#[from] SourceError),
}

/// Result of a successful [`Materializer::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult<T> {
    /// Index the value is consistent at.
    pub index: u64,
    /// The view's result value.
    pub value: T,
    /// `true` if the query was satisfied without blocking.
    pub cached: bool,
}

struct MatState<V: View> {
    view: V,
    index: u64,
    last_err: Option<Arc<MaterializerError>>,
}

/// Owns one [`View`]'s index and state; updated by a single consumer task,
/// queried by many concurrent callers.
pub struct Materializer<V: View> {
    state: Mutex<MatState<V>>,
    wake: watch::Sender<u64>,
}

impl<V: View> Materializer<V> {
    /// Creates a materializer around a freshly constructed view.
    #[must_use]
    pub fn new(view: V) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            state: Mutex::new(MatState {
                view,
                index: 0,
                last_err: None,
            }),
            wake,
        }
    }

    /// Returns the last index committed by [`update_view`](Self::update_view),
    /// or 0 if no snapshot has completed since construction or the last
    /// reset.
    #[must_use]
    pub fn current_index(&self) -> u64 {
        self.state.lock().index
    }

    /// Applies one batch of events atomically and advances the index.
    ///
    /// On success the recorded error is cleared and all blocked queriers
    /// are woken. On failure the index is not advanced and the error is
    /// returned; the caller treats this as fatal for the current
    /// subscription attempt.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializerError::View`] if the view rejects the batch.
    pub fn update_view(&self, events: &[V::Event], index: u64) -> Result<(), MaterializerError> {
        {
            let mut state = self.state.lock();
            state.view.apply(events)?;
            state.index = index;
            state.last_err = None;
        }
        self.wake.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Clears the view and returns the index to 0.
    ///
    /// Used when the source forces a resnapshot or when a handler error
    /// invalidates the accumulated state. Blocked queriers are woken and
    /// will observe "no snapshot yet" rather than an error.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.view.reset();
            state.index = 0;
            state.last_err = None;
        }
        self.wake.send_modify(|generation| *generation += 1);
    }

    /// Records a terminal error for the current subscription attempt and
    /// wakes blocked queriers so they observe it.
    pub fn record_error(&self, err: MaterializerError) {
        self.state.lock().last_err = Some(Arc::new(err));
        self.wake.send_modify(|generation| *generation += 1);
    }

    /// Blocks until the materialized index exceeds `min_index`, then
    /// returns the view's value at that index.
    ///
    /// Returns immediately (`cached = true`) when data past `min_index`
    /// has already materialized. When `deadline` elapses first, the
    /// last-known `(index, value)` is returned without error — a blocking
    /// read timing out is the normal path, not a failure. Cancellation is
    /// dropping the returned future.
    ///
    /// # Errors
    ///
    /// Returns the recorded error when a wakeup delivers one instead of
    /// data.
    pub async fn query(
        &self,
        min_index: u64,
        deadline: Option<Instant>,
    ) -> Result<QueryResult<V::Value>, MaterializerError> {
        let mut rx = self.wake.subscribe();

        let mut last = {
            let state = self.state.lock();
            QueryResult {
                index: state.index,
                value: state.view.value(state.index),
                cached: true,
            }
        };
        if last.index > 0 && last.index > min_index {
            return Ok(last);
        }
        last.cached = false;

        loop {
            match deadline {
                Some(at) => tokio::select! {
                    _ = rx.changed() => {}
                    () = tokio::time::sleep_until(at.into()) => return Ok(last),
                },
                None => {
                    // The wake sender lives inside `self`, so `changed`
                    // cannot observe a dropped sender here.
                    let _ = rx.changed().await;
                }
            }

            {
                let state = self.state.lock();
                last.index = state.index;
                if let Some(err) = &state.last_err {
                    return Err((**err).clone());
                }
                last.value = state.view.value(state.index);
            }
            if last.index > min_index {
                return Ok(last);
            }
        }
    }
}

impl<V: View> std::fmt::Debug for Materializer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Materializer")
            .field("index", &state.index)
            .field("has_err", &state.last_err.is_some())
            .finish()
    }
}
