//! View capability — the pluggable aggregator a materializer drives.
//!
//! A view turns a sequence of domain events into a point-in-time result
//! value. Implementations are supplied by the domain (one per logical
//! query shape); the engine only ever calls [`View::apply`],
//! [`View::value`], and [`View::reset`], and never inspects the state in
//! between.

use thiserror::Error;

/// Error returned by a [`View`] when an event batch cannot be applied.
///
/// Any apply error is terminal for the current subscription attempt: the
/// materializer is reset and the consumer reconnects from scratch.
#[derive(Debug, Clone, Error)]
#[error("view update failed: {0}")]
pub struct ViewError(
    /// Human-readable cause.
    pub String,
);

impl ViewError {
    /// Creates a view error from any displayable cause.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Aggregates domain events into a cache-able result value.
///
/// # Contract
///
/// - [`apply`](View::apply) applies one batch atomically and must be safe
///   to call once with an entire initial snapshot.
/// - [`value`](View::value) is a pure projection, callable at any time —
///   including before any `apply`, in which case it returns an
///   empty-but-valid value.
/// - [`reset`](View::reset) returns to the pre-`apply` state; called
///   before a replacement snapshot is loaded.
pub trait View: Send + 'static {
    /// Domain event payload consumed by this view.
    type Event: Clone + Send + Sync + 'static;

    /// Result value produced by this view.
    type Value: Clone + Send + Sync + 'static;

    /// Applies one batch of events atomically.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError`] if the batch is inconsistent with the view's
    /// state; the engine treats this as fatal for the subscription attempt.
    fn apply(&mut self, events: &[Self::Event]) -> Result<(), ViewError>;

    /// Returns the result value consistent with exactly the events applied
    /// so far, labeled with the given index.
    fn value(&self, index: u64) -> Self::Value;

    /// Discards all applied state.
    fn reset(&mut self);
}
