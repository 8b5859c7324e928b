//! Stream consumer — keeps one materializer current from a subscription.
//!
//! One consumer task runs per active materializer. It opens a subscription
//! at the materializer's last index (so reconnects resume instead of
//! re-snapshotting when the source allows it), feeds every event through
//! the handler state machine, and reconnects with backoff on failure. A
//! reconnect never drops previously materialized data: the last good
//! `(index, view)` stays queryable until a new snapshot commits or an
//! error is explicitly recorded.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::handler::{EventHandler, HandlerProgress};
use crate::materializer::{Materializer, MaterializerError};
use crate::retry::{RetryConfig, Waiter};
use crate::source::{EventSource, SourceError, SubscribeRequest, SurfacePolicy};
use crate::view::View;

/// Why one subscription attempt ended.
enum SubscriptionExit {
    Shutdown,
    Source(SourceError),
    Handler(MaterializerError),
}

/// The persistent subscribe/replay/reconnect loop for one materializer.
struct Consumer<V: View> {
    materializer: Arc<Materializer<V>>,
    source: Arc<dyn EventSource<Event = V::Event>>,
    request: SubscribeRequest,
    policy: SurfacePolicy,
    waiter: Waiter,
    shutdown: watch::Receiver<bool>,
}

/// Spawns a consumer task and returns its lifecycle handle.
///
/// The task runs until [`ConsumerHandle::shutdown`] is called or the
/// handle is dropped.
pub fn spawn<V: View>(
    materializer: Arc<Materializer<V>>,
    source: Arc<dyn EventSource<Event = V::Event>>,
    request: SubscribeRequest,
    policy: SurfacePolicy,
    retry: RetryConfig,
) -> ConsumerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = Consumer {
        materializer,
        source,
        request,
        policy,
        waiter: Waiter::new(retry),
        shutdown: shutdown_rx,
    };
    ConsumerHandle {
        shutdown_tx,
        task: Some(tokio::spawn(consumer.run())),
    }
}

impl<V: View> Consumer<V> {
    async fn run(mut self) {
        loop {
            match self.run_subscription().await {
                SubscriptionExit::Shutdown => return,
                SubscriptionExit::Source(SourceError::ResetStream) => {
                    tracing::debug!(key = %self.request.key, "source requested stream reset");
                    self.materializer.reset();
                }
                SubscriptionExit::Source(err) => {
                    let surface = match self.policy {
                        SurfacePolicy::Immediate => true,
                        SurfacePolicy::AfterRepeat => {
                            !err.is_temporary() || self.waiter.failures() > 0
                        }
                    };
                    tracing::warn!(
                        key = %self.request.key,
                        error = %err,
                        surface,
                        "subscription attempt failed"
                    );
                    if surface {
                        self.materializer.record_error(err.into());
                    }
                }
                SubscriptionExit::Handler(err) => {
                    tracing::warn!(
                        key = %self.request.key,
                        error = %err,
                        "event handling failed; clearing view"
                    );
                    self.materializer.reset();
                    self.materializer.record_error(err);
                }
            }
            if self.waiter.wait(&mut self.shutdown).await.is_err() {
                return;
            }
        }
    }

    /// Opens one subscription and drives it until it fails or shuts down.
    async fn run_subscription(&mut self) -> SubscriptionExit {
        let mut req = self.request.clone();
        req.index = self.materializer.current_index();
        let mut handler = EventHandler::for_index(req.index);

        let mut stream = tokio::select! {
            _ = self.shutdown.wait_for(|stop| *stop) => return SubscriptionExit::Shutdown,
            subscribed = self.source.subscribe(&req) => match subscribed {
                Ok(stream) => stream,
                Err(err) => return SubscriptionExit::Source(err),
            },
        };

        loop {
            let event = tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => return SubscriptionExit::Shutdown,
                event = stream.next_event() => match event {
                    Ok(event) => event,
                    Err(err) => return SubscriptionExit::Source(err),
                },
            };
            match handler.handle(&self.materializer, event) {
                Ok(HandlerProgress::Committed) => self.waiter.reset(),
                Ok(HandlerProgress::Buffered) => {}
                Err(err) => return SubscriptionExit::Handler(err),
            }
        }
    }
}

/// Lifecycle handle for a spawned consumer task.
///
/// Dropping the handle signals shutdown; the task drains its current
/// select point and exits.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Signals the consumer task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Returns `true` once the consumer task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals shutdown and waits for the task to exit.
    pub async fn join(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
