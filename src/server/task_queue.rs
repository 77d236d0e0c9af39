//! Task queue — the intake channel between submission and the worker pool.
//!
//! Distinct from [`super::event_queue::EventQueue`]: the event queue fans
//! *outbound* `StreamResponse` events to subscribers, while the task queue
//! carries *inbound* task ids from [`super::task_manager::TaskManager`] to
//! the [`super::worker_pool::WorkerPool`].

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{A2AError, A2AResult};

/// Interface for the engine's work-intake queue.
///
/// Implementations decouple task submission from task execution: `enqueue`
/// is called by the submitting side (never blocks — bounded queues signal
/// backpressure via [`A2AError::QueueFull`] instead), and `dequeue` is
/// called by worker loops.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task id for processing.
    ///
    /// Returns `Err(A2AError::QueueFull)` if the queue is at capacity —
    /// callers should surface this to the submitter rather than blocking,
    /// so a slow worker pool produces backpressure instead of unbounded
    /// memory growth.
    async fn enqueue(&self, task_id: String) -> A2AResult<()>;

    /// Wait for the next task id, or `None` if the queue has shut down.
    async fn dequeue(&self) -> Option<String>;

    /// Number of task ids currently buffered.
    fn size(&self) -> usize;
}

/// Bounded in-memory task queue backed by `tokio::sync::mpsc`.
///
/// `enqueue` uses `try_send`, so a full queue fails fast rather than making
/// the submitting request wait on worker throughput. `dequeue` races the
/// channel receiver against a shutdown signal so a worker loop blocked on
/// `dequeue` wakes up promptly when the pool is asked to stop.
pub struct InMemoryTaskQueue {
    tx: mpsc::Sender<String>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    shutdown: watch::Receiver<bool>,
    capacity: usize,
    len: std::sync::atomic::AtomicUsize,
}

impl InMemoryTaskQueue {
    /// Create a new queue with the given capacity, stopping when `shutdown`
    /// is set to `true`.
    pub fn new(capacity: usize, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            shutdown,
            capacity,
            len: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task_id: String) -> A2AResult<()> {
        match self.tx.try_send(task_id) {
            Ok(()) => {
                self.len.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(A2AError::queue_full(format!(
                "task queue at capacity ({})",
                self.capacity
            ))),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(A2AError::queue_full("task queue is shut down"))
            }
        }
    }

    async fn dequeue(&self) -> Option<String> {
        let mut rx = self.rx.lock().await;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Task queue shutting down");
                        return None;
                    }
                }
                item = rx.recv() => {
                    if item.is_some() {
                        self.len.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    }
                    return item;
                }
            }
        }
    }

    fn size(&self) -> usize {
        self.len.load(std::sync::atomic::Ordering::SeqCst)
    }
}
