//! Event-handler state machine driving a materializer.
//!
//! Classifies incoming framing events and commits view updates atomically
//! per turn. The machine separates "did we just receive a fresh base
//! state" (Snapshot) from "are we applying incremental deltas" (Stream),
//! because the source may unilaterally force a resnapshot mid-stream
//! without closing the subscription.

use crate::event::Event;
use crate::materializer::{Materializer, MaterializerError};
use crate::view::View;

/// What a successfully handled event did to the materializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerProgress {
    /// The event was buffered into a pending snapshot; nothing committed.
    Buffered,
    /// A view update was committed and the index advanced.
    Committed,
}

enum HandlerState<E> {
    /// Accumulating snapshot events until the end-of-snapshot marker.
    Snapshot { accumulated: Vec<E> },
    /// Applying each event or batch as it arrives.
    Stream,
    /// Continuing an existing view; the first event decides whether the
    /// source honored the resume or demands a fresh snapshot.
    Resume,
}

/// The per-subscription state machine.
///
/// Created at subscription start from the materializer's last-known index
/// and driven once per received event. Any error is terminal for the
/// current subscription attempt.
pub struct EventHandler<V: View> {
    state: HandlerState<V::Event>,
}

impl<V: View> EventHandler<V> {
    /// Chooses the start state for a subscription resuming at `index`:
    /// 0 means no view exists yet (load a snapshot), anything else
    /// attempts to continue the existing view.
    #[must_use]
    pub fn for_index(index: u64) -> Self {
        let state = if index == 0 {
            HandlerState::Snapshot {
                accumulated: Vec::new(),
            }
        } else {
            HandlerState::Resume
        };
        Self { state }
    }

    /// Feeds one event through the machine, updating `mat` as required.
    ///
    /// # Errors
    ///
    /// Propagates [`MaterializerError`] from a failed view update; the
    /// caller must reset the materializer and abandon the subscription
    /// attempt.
    pub fn handle(
        &mut self,
        mat: &Materializer<V>,
        event: Event<V::Event>,
    ) -> Result<HandlerProgress, MaterializerError> {
        match event {
            Event::NewSnapshotToFollow => {
                mat.reset();
                self.state = HandlerState::Snapshot {
                    accumulated: Vec::new(),
                };
                Ok(HandlerProgress::Buffered)
            }
            Event::EndOfSnapshot { index } => match &mut self.state {
                HandlerState::Snapshot { accumulated } => {
                    let events = std::mem::take(accumulated);
                    mat.update_view(&events, index)?;
                    self.state = HandlerState::Stream;
                    Ok(HandlerProgress::Committed)
                }
                HandlerState::Stream | HandlerState::Resume => {
                    // A stray end-of-snapshot outside a snapshot load only
                    // finalizes the index.
                    mat.update_view(&[], index)?;
                    self.state = HandlerState::Stream;
                    Ok(HandlerProgress::Committed)
                }
            },
            Event::Item { .. } | Event::Batch { .. } => {
                let index = event.index();
                match &mut self.state {
                    HandlerState::Snapshot { accumulated } => {
                        accumulated.extend(event.into_items());
                        Ok(HandlerProgress::Buffered)
                    }
                    HandlerState::Stream | HandlerState::Resume => {
                        mat.update_view(&event.into_items(), index)?;
                        self.state = HandlerState::Stream;
                        Ok(HandlerProgress::Committed)
                    }
                }
            }
        }
    }
}
