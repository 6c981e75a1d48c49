use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::{CoreError, Result};

/// Process-wide owner of every long-running loop.
///
/// Each background loop holds exactly one tracked task slot; `shutdown`
/// signals cancellation and then waits for all of them, so no in-flight
/// claim or subprocess wait is abandoned before the process exits.
pub struct Supervisor {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Child token for a loop to select on. Cancelling the supervisor
    /// cancels every child.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawn a tracked background task. The future should observe a token
    /// from [`cancellation_token`](Self::cancellation_token) and drain its
    /// current iteration when it fires.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(fut);
    }

    /// Signal cancellation and wait up to `grace` for all tracked tasks.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        info!("shutdown signalled; draining background loops");
        self.token.cancel();
        self.tracker.close();

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("all background loops drained");
                Ok(())
            }
            Err(_) => {
                let remaining = self.tracker.len();
                warn!(remaining, "shutdown grace expired with tasks still running");
                Err(CoreError::ShutdownTimeout {
                    secs: grace.as_secs(),
                    remaining,
                })
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_waits_for_tracked_tasks() {
        let sup = Supervisor::new();
        let finished = Arc::new(AtomicBool::new(false));
        let token = sup.cancellation_token();

        let flag = Arc::clone(&finished);
        sup.spawn(async move {
            token.cancelled().await;
            // simulate draining the current iteration
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        sup.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_task() {
        let sup = Supervisor::new();
        sup.spawn(async {
            // never observes cancellation
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let err = sup.shutdown(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, CoreError::ShutdownTimeout { .. }));
    }
}
