//! Delayed, cancelable tasks for debouncing hardware writes.
//!
//! Sensors get a [`Scheduler`] injected instead of owning a timer, so tests can
//! drive time by hand with `ManualScheduler`.

use log::warn;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task.
///
/// Cancelling discards the task if it has not started; a task that is already
/// running is not interrupted.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask;
}

/// Runs tasks on the blocking pool of a tokio runtime after their delay.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling task.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        self.handle.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = tokio::task::spawn_blocking(task).await {
                        warn!("Scheduled task failed: {}", e);
                    }
                }
            }
        });

        ScheduledTask { token }
    }
}

#[cfg(test)]
pub use manual::ManualScheduler;


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter_task(counter: &Arc<AtomicU32>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_scheduler_runs_due_tasks() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.schedule(Duration::from_millis(200), counter_task(&counter));

        assert_eq!(scheduler.advance(Duration::from_millis(199)), 0);
        assert_eq!(scheduler.advance(Duration::from_millis(1)), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_scheduler_skips_cancelled() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let task = scheduler.schedule(Duration::from_millis(200), counter_task(&counter));
        task.cancel();

        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel_before_due() {
        let scheduler = TokioScheduler::current();
        let counter = Arc::new(AtomicU32::new(0));

        let first = scheduler.schedule(Duration::from_millis(200), counter_task(&counter));
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.cancel();
        scheduler.schedule(Duration::from_millis(200), counter_task(&counter));

        tokio::time::sleep(Duration::from_millis(500)).await;
        // Let the blocking task finish.
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
