//! Fixed-capacity hand-off between the camera callback and the publisher.

use bytes::Bytes;
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

pub const DEFAULT_CAPACITY: usize = 5;

/// Encoded depth data as delivered by the camera, awaiting compression.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCapture {
    pub payload: Bytes,
    /// Wall-clock milliseconds at enqueue.
    pub timestamp_ms: i64,
}

/// Single-producer single-consumer ring. Pushing never blocks: when every
/// slot is taken the newest capture is dropped.
pub struct CaptureQueue {
    tx: mpsc::Sender<QueuedCapture>,
    rx: Mutex<mpsc::Receiver<QueuedCapture>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false when the capture was dropped.
    pub fn push(&self, capture: QueuedCapture) -> bool {
        match self.tx.try_send(capture) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Capture queue full, dropping frame ({} dropped so far)", dropped);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Next capture, waiting at most `wait`.
    pub async fn pop(&self, wait: Duration) -> Option<QueuedCapture> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Captures waiting; a slot frees as soon as the consumer takes one.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for CaptureQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
