//! Wait-handle primitives for blocking queries.
//!
//! A [`Trigger`] is owned by whoever mutates a watched slice of data; a
//! [`WatchHandle`] is the registered signal that fires when it does. A
//! query function collects the handles for whatever sub-ranges it actually
//! read into a [`WatchSet`], which the blocking-query loop then waits on
//! instead of polling.

use std::time::Instant;

use smallvec::SmallVec;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// A registered signal that fires when the watched data changes.
///
/// Handles subscribed before a mutation observe it; a handle subscribed
/// after sees only later mutations.
pub type WatchHandle = watch::Receiver<()>;

/// The sender side of a wait-handle; fired by a store on mutation of the
/// data it guards.
#[derive(Debug)]
pub struct Trigger {
    tx: watch::Sender<()>,
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger {
    /// Creates an unfired trigger.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(());
        Self { tx }
    }

    /// Wakes every handle currently subscribed.
    pub fn fire(&self) {
        self.tx.send_replace(());
    }

    /// Returns a fresh handle observing mutations from this point on.
    #[must_use]
    pub fn watch(&self) -> WatchHandle {
        self.tx.subscribe()
    }
}

/// Which condition ended a [`WatchSet::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A registered data handle fired.
    Data,
    /// The store-wide abandon handle fired (wholesale replacement).
    Abandoned,
    /// The deadline elapsed with no wakeup.
    DeadlineElapsed,
}

/// The set of wait-handles one query round blocks on.
///
/// Rebuilt fresh for every round: the query function registers handles for
/// the data it read, and the loop waits on all of them plus the store's
/// abandon handle.
#[derive(Debug, Default)]
pub struct WatchSet {
    handles: SmallVec<[WatchHandle; 8]>,
    abandon: Option<WatchHandle>,
}

impl WatchSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a data handle.
    pub fn add(&mut self, handle: WatchHandle) {
        self.handles.push(handle);
    }

    /// Registers the store's abandon handle, reported separately from data
    /// wakeups.
    pub fn set_abandon(&mut self, handle: WatchHandle) {
        self.abandon = Some(handle);
    }

    /// Returns the number of registered data handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if no data handles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Blocks until any data handle fires, the abandon handle fires, or
    /// the deadline elapses.
    ///
    /// A handle whose trigger was dropped without firing never wakes the
    /// set; a dropped abandon trigger counts as abandoned. With no
    /// deadline and nothing registered the future never resolves —
    /// cancellation is dropping it.
    pub async fn wait(mut self, deadline: Option<Instant>) -> WakeReason {
        let mut fired = JoinSet::new();
        for mut handle in self.handles.drain(..) {
            fired.spawn(async move {
                if handle.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            });
        }

        let mut abandon = self.abandon.take();
        let abandoned = async {
            match abandon.as_mut() {
                Some(handle) => {
                    let _ = handle.changed().await;
                }
                None => std::future::pending().await,
            }
        };
        let deadline_elapsed = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            Some(_) = fired.join_next() => WakeReason::Data,
            () = abandoned => WakeReason::Abandoned,
            () = deadline_elapsed => WakeReason::DeadlineElapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline_in(millis: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(millis))
    }

    #[tokio::test]
    async fn test_wait_wakes_on_fire() {
        let trigger = Trigger::new();
        let mut set = WatchSet::new();
        set.add(trigger.watch());

        let waiter = tokio::spawn(set.wait(deadline_in(5000)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.fire();

        assert_eq!(waiter.await.unwrap(), WakeReason::Data);
    }

    #[tokio::test]
    async fn test_wait_sees_fire_between_watch_and_wait() {
        let trigger = Trigger::new();
        let mut set = WatchSet::new();
        set.add(trigger.watch());
        trigger.fire();

        assert_eq!(set.wait(deadline_in(5000)).await, WakeReason::Data);
    }

    #[tokio::test]
    async fn test_wait_any_of_many_handles() {
        let first = Trigger::new();
        let second = Trigger::new();
        let mut set = WatchSet::new();
        set.add(first.watch());
        set.add(second.watch());

        let waiter = tokio::spawn(set.wait(deadline_in(5000)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        second.fire();

        assert_eq!(waiter.await.unwrap(), WakeReason::Data);
    }

    #[tokio::test]
    async fn test_wait_deadline() {
        let trigger = Trigger::new();
        let mut set = WatchSet::new();
        set.add(trigger.watch());

        let start = Instant::now();
        assert_eq!(set.wait(deadline_in(20)).await, WakeReason::DeadlineElapsed);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_wait_abandon_reported_separately() {
        let data = Trigger::new();
        let abandon = Trigger::new();
        let mut set = WatchSet::new();
        set.add(data.watch());
        set.set_abandon(abandon.watch());

        let waiter = tokio::spawn(set.wait(deadline_in(5000)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandon.fire();

        assert_eq!(waiter.await.unwrap(), WakeReason::Abandoned);
    }

    #[tokio::test]
    async fn test_dropped_trigger_does_not_wake() {
        let trigger = Trigger::new();
        let mut set = WatchSet::new();
        set.add(trigger.watch());
        drop(trigger);

        assert_eq!(set.wait(deadline_in(20)).await, WakeReason::DeadlineElapsed);
    }

    #[tokio::test]
    async fn test_empty_set_waits_for_deadline() {
        let set = WatchSet::new();
        assert_eq!(set.wait(deadline_in(20)).await, WakeReason::DeadlineElapsed);
    }

    #[test]
    fn test_len_and_is_empty() {
        let trigger = Trigger::new();
        let mut set = WatchSet::new();
        assert!(set.is_empty());
        set.add(trigger.watch());
        set.add(trigger.watch());
        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
    }
}
