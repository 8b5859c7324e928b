//! Subscription-backend capability consumed by the stream consumer.
//!
//! Two backend flavors exist: an in-process backend reading the local
//! replicated store, and an RPC backend consuming a remote publisher. Both
//! implement [`EventSource`]; they differ only in transport and in which
//! [`SurfacePolicy`] the consumer applies to their failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;

/// Parameters for opening one subscription.
///
/// `index` is the subscriber's last materialized index: 0 requests a full
/// snapshot, anything else asks the source to resume with deltas when it
/// still can.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Logical key being watched (e.g. a service name).
    pub key: String,
    /// Datacenter the data lives in.
    pub datacenter: String,
    /// Opaque ACL token carried to the source.
    pub token: String,
    /// Last index already materialized by the subscriber.
    pub index: u64,
}

/// Error produced by a subscription backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The source asked the subscriber to drop its state and resubscribe
    /// from scratch. Always retryable; never surfaced to readers.
    #[error("stream reset requested by source")]
    ResetStream,

    /// A transient failure (network blip, leader change). Retryable.
    #[error("temporary stream failure: {0}")]
    Temporary(String),

    /// The token no longer grants access to the watched data.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request itself is malformed; retrying cannot help until it
    /// changes.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The source closed the stream without an error payload.
    #[error("stream closed by source")]
    StreamClosed,

    /// An unclassified backend failure.
    #[error("stream error: {0}")]
    Internal(String),
}

impl SourceError {
    /// Returns `true` for failures that are expected to clear on their own
    /// and should not be surfaced eagerly to blocked readers.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            SourceError::ResetStream | SourceError::Temporary(_) | SourceError::StreamClosed
        )
    }
}

/// When a consumer surfaces subscription failures to blocked readers.
///
/// The asymmetry is deliberate: an in-process backend failing is
/// significant and surfaced at once, while a remote backend gets one free
/// transient failure so a single network blip does not flap errors at
/// readers. It is policy, not an invariant — requests choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfacePolicy {
    /// Record every failure on the materializer immediately.
    Immediate,
    /// Record a failure only when it is non-temporary or is not the first
    /// consecutive one.
    AfterRepeat,
}

/// A live subscription yielding ordered events.
#[async_trait]
pub trait EventStream: Send {
    /// Domain payload carried by this stream's events.
    type Event;

    /// Waits for the next event.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the stream fails or the source ends
    /// it; any error terminates the subscription attempt.
    async fn next_event(&mut self) -> Result<Event<Self::Event>, SourceError>;
}

/// A subscription backend: opens streams of events for a watched key.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Domain payload carried by streams from this source.
    type Event: Clone + Send + Sync + 'static;

    /// Opens a subscription described by `req`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the subscription cannot be opened.
    async fn subscribe(
        &self,
        req: &SubscribeRequest,
    ) -> Result<Box<dyn EventStream<Event = Self::Event>>, SourceError>;
}
