//! Tracks background work so callers can wait for the queue to settle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Count of scheduling passes, transfers and retry timers still running.
#[derive(Default)]
pub(crate) struct Activity {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Activity {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers one unit of work until the guard is dropped.
    pub(crate) fn enter(self: &Arc<Self>) -> ActivityGuard {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            activity: Arc::clone(self),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a wakeup between the two is not lost
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct ActivityGuard {
    activity: Arc<Activity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.activity.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.activity.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_idle() {
        let activity = Activity::new();
        tokio::time::timeout(Duration::from_secs(1), activity.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_every_guard() {
        let activity = Activity::new();
        let first = activity.enter();
        let second = activity.enter();

        let waiter = {
            let activity = activity.clone();
            tokio::spawn(async move { activity.wait_idle().await })
        };

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(activity.is_idle());
    }
}
