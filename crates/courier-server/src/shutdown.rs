//! Graceful shutdown of tracked server tasks.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Drains task groups within a grace period, then cancels what is left.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Coordinate shutdown of everything tied to `token`.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token, signalling every task tied to it.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait up to `grace` for the tasks in `tracker` to finish.
    ///
    /// Closes the tracker first so the wait can complete. Returns `true`
    /// if every task finished in time.
    pub async fn drain(&self, name: &str, tracker: &TaskTracker, grace: Duration) -> bool {
        let _ = tracker.close();
        info!(group = name, task_count = tracker.len(), ?grace, "waiting for tasks to complete");
        if tokio::time::timeout(grace, tracker.wait()).await.is_ok() {
            true
        } else {
            warn!(group = name, remaining = tracker.len(), "shutdown timed out after {grace:?}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_cancels_token() {
        let coord = ShutdownCoordinator::new(CancellationToken::new());
        let token = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(token.is_cancelled());
        assert!(coord.is_shutting_down());
    }

    #[test]
    fn child_tokens_follow_parent() {
        let coord = ShutdownCoordinator::new(CancellationToken::new());
        let child = coord.token().child_token();
        coord.shutdown();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_tasks() {
        let coord = ShutdownCoordinator::new(CancellationToken::new());
        let tracker = TaskTracker::new();
        let _ = tracker.spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert!(coord.drain("test", &tracker, Duration::from_secs(5)).await);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_on_stuck_task() {
        let coord = ShutdownCoordinator::new(CancellationToken::new());
        let tracker = TaskTracker::new();
        let _ = tracker.spawn(std::future::pending::<()>());
        assert!(!coord.drain("test", &tracker, Duration::from_millis(100)).await);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn drain_of_empty_tracker_is_immediate() {
        let coord = ShutdownCoordinator::new(CancellationToken::new());
        assert!(coord.drain("empty", &TaskTracker::new(), Duration::from_millis(1)).await);
    }
}
