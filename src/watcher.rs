//! # Change Watcher
//!
//! A bounded-wait notification latch. The replicated-store adapter calls
//! [`ChangeWatcher::on_change`] from its own callback thread; a reader task
//! blocks in [`ChangeWatcher::wait_for_update`] until a change is pending or
//! the timeout expires.
//!
//! ## Latching
//!
//! The pending flag is a single boolean behind one lock. A change that
//! arrives while nobody is waiting stays latched and is consumed by the next
//! wait, so notifications are never lost. Several changes that arrive before
//! a wait collapse into one pending notification: each wait consumes at most
//! one.
//!
//! ## End-of-stream detection
//!
//! Readers treat a wait that times out as "the writer has stopped". That is
//! a heuristic: a live but slow update stream is indistinguishable from a
//! finished one, which is why the timeout is configurable.

use crate::store::ChangeListener;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Result of [`ChangeWatcher::wait_for_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A pending change was consumed
    Updated,
    /// The timeout elapsed without a change
    TimedOut,
}

#[derive(Debug, Default)]
struct WatchState {
    update_pending: bool,
    changes_seen: u64,
}

/// Latched change notification shared between a store callback and a reader
#[derive(Debug, Default)]
pub struct ChangeWatcher {
    state: Mutex<WatchState>,
    notify: Notify,
}

impl ChangeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change and wake the waiter. Safe to call from any thread.
    pub fn on_change(&self) {
        {
            let mut state = self.state.lock();
            state.update_pending = true;
            state.changes_seen += 1;
        }
        self.notify.notify_one();
    }

    /// Wait until a change is pending or `timeout` elapses.
    ///
    /// `Duration::ZERO` waits indefinitely. On return with
    /// [`WaitOutcome::Updated`] the pending flag has been reset.
    pub async fn wait_for_update(&self, timeout: Duration) -> WaitOutcome {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };

        loop {
            // Register interest before checking the flag so a change landing
            // between the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.take_pending() {
                return WaitOutcome::Updated;
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return if self.take_pending() {
                            WaitOutcome::Updated
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
            }
            trace!("watcher woke up, rechecking pending flag");
        }
    }

    /// Whether a change is latched and not yet consumed.
    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.state.lock().update_pending
    }

    /// Total number of change callbacks received.
    pub fn change_count(&self) -> u64 {
        self.state.lock().changes_seen
    }

    fn take_pending(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.update_pending, false)
    }
}

impl ChangeListener for ChangeWatcher {
    fn on_change(&self) {
        ChangeWatcher::on_change(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// A change that arrives before anyone waits is not lost
    #[tokio::test]
    async fn test_change_before_wait_is_latched() {
        let watcher = ChangeWatcher::new();
        watcher.on_change();
        assert!(watcher.is_pending());
        assert_eq!(
            watcher.wait_for_update(Duration::from_millis(10)).await,
            WaitOutcome::Updated
        );
        assert!(!watcher.is_pending());
    }

    /// Several changes before a wait are consumed as one
    #[tokio::test]
    async fn test_at_most_one_notification_per_wait() {
        let watcher = ChangeWatcher::new();
        watcher.on_change();
        watcher.on_change();
        assert_eq!(
            watcher.wait_for_update(Duration::from_millis(10)).await,
            WaitOutcome::Updated
        );
        assert_eq!(
            watcher.wait_for_update(Duration::from_millis(30)).await,
            WaitOutcome::TimedOut
        );
        assert_eq!(watcher.change_count(), 2);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_change() {
        let watcher = ChangeWatcher::new();
        let started = std::time::Instant::now();
        assert_eq!(
            watcher.wait_for_update(Duration::from_millis(50)).await,
            WaitOutcome::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    /// Changes delivered from a foreign OS thread wake the waiting task
    #[tokio::test]
    async fn test_wake_from_callback_thread() {
        let watcher = Arc::new(ChangeWatcher::new());
        let remote = Arc::clone(&watcher);
        let callback = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.on_change();
        });

        assert_eq!(watcher.wait_for_update(Duration::ZERO).await, WaitOutcome::Updated);
        callback.join().unwrap();
    }

    /// A stale wake-up permit without a pending change keeps waiting
    #[tokio::test]
    async fn test_spurious_wake_rewaits() {
        let watcher = ChangeWatcher::new();
        watcher.notify.notify_one();
        assert_eq!(
            watcher.wait_for_update(Duration::from_millis(40)).await,
            WaitOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_listener_trait_dispatch() {
        let watcher = Arc::new(ChangeWatcher::new());
        let listener: Arc<dyn ChangeListener> = watcher.clone();
        listener.on_change();
        assert!(watcher.is_pending());
    }
}
