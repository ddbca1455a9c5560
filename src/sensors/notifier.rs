//! Sensor-ready signal for the coordinator's service loop.
//!
//! Capture callbacks call `notify()` after queueing a frame so the loop wakes
//! up instead of waiting out its idle interval.

use std::sync::Arc;
use tokio::sync::Notify;

/// Wakes the service loop when a sensor likely has data.
///
/// At most one wakeup is stored while the loop is busy, so bursts of
/// notifications collapse into a single extra loop pass. This is a
/// non-blocking operation and is safe to call from hardware threads.
#[derive(Clone, Default)]
pub struct ReadyNotifier {
    signal: Arc<Notify>,
}

impl ReadyNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that at least one sensor has pending data.
    pub fn notify(&self) {
        self.signal.notify_one();
    }

    /// Wait for the next signal (or a stored one).
    pub async fn notified(&self) {
        self.signal.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stored_permit_wakes_next_wait() {
        let notifier = ReadyNotifier::new();
        notifier.notify();
        notifier.notify();

        let woke = tokio::time::timeout(Duration::from_millis(50), notifier.notified()).await;
        assert!(woke.is_ok());

        // Both notifications collapsed into one permit.
        let woke = tokio::time::timeout(Duration::from_millis(50), notifier.notified()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn test_notify_from_other_thread() {
        let notifier = ReadyNotifier::new();
        let remote = notifier.clone();
        std::thread::spawn(move || remote.notify()).join().unwrap();

        tokio::time::timeout(Duration::from_secs(1), notifier.notified())
            .await
            .unwrap();
    }
}
