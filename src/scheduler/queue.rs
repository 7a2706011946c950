//! In-process run queue.
//!
//! Hands submitted run ids to the worker pool. Deliberately not a broker:
//! the durable state store is the source of truth, and a worker that
//! crashes mid-run is covered by the stale-run recovery sweep, not by
//! queue-level redelivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed (all senders or the receiver dropped).
    #[error("Queue is closed")]
    Closed,
}

/// A queued request to drive one run.
#[derive(Debug, Clone)]
pub struct QueuedRun {
    /// The run to drive.
    pub run_id: Uuid,
    /// When the request was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Unbounded in-process queue of runs awaiting a worker.
pub struct RunQueue {
    tx: mpsc::UnboundedSender<QueuedRun>,
    rx: Mutex<mpsc::UnboundedReceiver<QueuedRun>>,
    pending: AtomicUsize,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueues a run for driving.
    pub fn enqueue(&self, run_id: Uuid) -> Result<(), QueueError> {
        self.tx
            .send(QueuedRun {
                run_id,
                enqueued_at: Utc::now(),
            })
            .map_err(|_| QueueError::Closed)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Dequeues the next run, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout expires with nothing queued.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedRun>, QueueError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(queued)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(queued))
            }
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }

    /// Number of runs currently waiting.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let queue = RunQueue::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();
        assert_eq!(queue.len(), 2);

        let a = queue
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let b = queue
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(a.run_id, first);
        assert_eq!(b.run_id, second);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_timeout_returns_none() {
        let queue = RunQueue::new();

        let result = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_enqueued_at_is_set() {
        let queue = RunQueue::new();
        queue.enqueue(Uuid::new_v4()).unwrap();

        let queued = queue
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert!(Utc::now() - queued.enqueued_at < chrono::Duration::seconds(5));
    }
}
