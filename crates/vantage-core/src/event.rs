//! Event envelope for subscription streams.
//!
//! An event carries an opaque domain payload `D` plus the minimal framing
//! the engine needs to drive a view: the index at which the change became
//! visible, and the snapshot markers that separate "initial full state"
//! from "incremental delta". The engine never inspects `D`; only the
//! [`View`](crate::view::View) implementation does.

/// One unit of change received from a subscription backend.
///
/// Indexes are monotonically non-decreasing within a subscription and may
/// skip values, so consumers compare with `>` / `>=`, never equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<D> {
    /// A single payload event visible at `index`.
    Item {
        /// Index at which this change became visible.
        index: u64,
        /// Opaque domain payload.
        item: D,
    },

    /// A list of payload events sharing one index, applied as one atomic
    /// unit.
    Batch {
        /// Index shared by every item in the batch.
        index: u64,
        /// Opaque domain payloads.
        items: Vec<D>,
    },

    /// Marks the end of the initial snapshot; `index` finalizes the load.
    EndOfSnapshot {
        /// Index the snapshot is consistent at.
        index: u64,
    },

    /// The source is about to replace, not append to, prior state. Sent
    /// mid-stream when the source forces a resnapshot.
    NewSnapshotToFollow,
}

impl<D> Event<D> {
    /// Returns the index stamped on this event, or 0 for markers that do
    /// not carry one.
    #[must_use]
    pub fn index(&self) -> u64 {
        match self {
            Event::Item { index, .. }
            | Event::Batch { index, .. }
            | Event::EndOfSnapshot { index } => *index,
            Event::NewSnapshotToFollow => 0,
        }
    }

    /// Returns `true` for the framing markers (end-of-snapshot and
    /// new-snapshot-to-follow), `false` for payload events.
    #[must_use]
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Event::EndOfSnapshot { .. } | Event::NewSnapshotToFollow
        )
    }

    /// Consumes the event and returns its payload items, if any.
    ///
    /// Framing markers yield an empty vec.
    #[must_use]
    pub fn into_items(self) -> Vec<D> {
        match self {
            Event::Item { item, .. } => vec![item],
            Event::Batch { items, .. } => items,
            Event::EndOfSnapshot { .. } | Event::NewSnapshotToFollow => Vec::new(),
        }
    }
}
