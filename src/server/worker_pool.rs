//! Worker pool — dequeues submitted task ids and drives them through an
//! [`AgentExecutor`] to completion.
//!
//! Distinct from the old one-task-per-request model: tasks are queued by
//! [`super::task_manager::TaskManager`] and picked up by a small, fixed
//! number of worker loops here, each enforcing a one-worker-per-task
//! invariant and catching panics so one misbehaving executor can't take the
//! rest of the pool down with it.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::A2AResult;
use crate::types::{Message, StreamResponse, TaskState, TaskStatus, TaskStatusUpdateEvent};

use super::agent_executor::{AgentExecutor, RequestContext};
use super::event_queue::{EventConsumer, QueueManager};
use super::state_machine::validate_transition;
use super::task_event_sink::apply_and_save;
use super::task_queue::TaskQueue;
use super::task_store::TaskStore;

/// Per-task cooperative-cancellation flags, shared between
/// [`super::task_manager::TaskManager::cancel`] and whichever worker is
/// currently holding a task.
///
/// A flag only exists for the duration a worker has the task checked out —
/// [`CancelRegistry::signal`] returning `false` means no worker currently
/// owns the task (it may be queued, or may have already finished).
#[derive(Default)]
pub struct CancelRegistry {
    flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh flag for `task_id`, replacing any stale one left
    /// behind by a previous run.
    async fn register(&self, task_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut flags = self.flags.lock().await;
        flags.insert(task_id.to_string(), Arc::clone(&flag));
        flag
    }

    async fn unregister(&self, task_id: &str) {
        let mut flags = self.flags.lock().await;
        flags.remove(task_id);
    }

    /// Signal cancellation for a task currently checked out by a worker.
    ///
    /// Returns `true` if a worker holds the task (a `canceled` status
    /// update will eventually follow), `false` if no worker currently owns
    /// it.
    pub async fn signal(&self, task_id: &str) -> bool {
        let flags = self.flags.lock().await;
        match flags.get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Drives queued tasks to completion by running the configured executor.
///
/// Grounded on the same shape as the task queue it reads from: a bounded
/// number of worker loops pulling ids off a shared queue, each dispatching
/// to the one [`AgentExecutor`] the server was built with.
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn TaskStore>,
    queues: Arc<dyn QueueManager>,
    executor: Arc<dyn AgentExecutor>,
    cancel_registry: Arc<CancelRegistry>,
    /// Task ids currently checked out by a worker — guards against a task id
    /// being dequeued twice concurrently (shouldn't happen with a single
    /// shared queue, but resubmission of an in-flight task is possible).
    processing: Mutex<HashSet<String>>,
}

impl WorkerPool {
    /// Build a worker pool around the given queue, store, event-queue
    /// manager, executor, and cancellation registry.
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn TaskStore>,
        queues: Arc<dyn QueueManager>,
        executor: Arc<dyn AgentExecutor>,
        cancel_registry: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            queue,
            store,
            queues,
            executor,
            cancel_registry,
            processing: Mutex::new(HashSet::new()),
        }
    }

    /// Spawn `worker_count` worker loops (minimum 1). Each loop runs until
    /// the task queue shuts down.
    pub fn spawn(self: &Arc<Self>, worker_count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count.max(1))
            .map(|id| {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.run(id).await })
            })
            .collect()
    }

    async fn run(self: Arc<Self>, worker_id: usize) {
        while let Some(task_id) = self.queue.dequeue().await {
            {
                let mut processing = self.processing.lock().await;
                if !processing.insert(task_id.clone()) {
                    warn!(worker_id, task_id = %task_id, "task already checked out — skipping");
                    continue;
                }
            }

            if let Err(err) = self.process_one(&task_id).await {
                error!(worker_id, task_id = %task_id, error = %err, "failed to process task");
            }

            self.processing.lock().await.remove(&task_id);
        }
        info!(worker_id, "worker loop stopped");
    }

    /// Transition a task into `working`, run the executor, and resolve the
    /// outcome (including panic recovery) into a final persisted event.
    async fn process_one(&self, task_id: &str) -> A2AResult<()> {
        let Some(current) = self.store.get(task_id).await? else {
            warn!(task_id, "dequeued task id not found in store — dropping");
            return Ok(());
        };

        if let Err(err) = validate_transition(current.status.state, TaskState::Working) {
            warn!(task_id, state = ?current.status.state, error = %err, "dequeued task is not workable — dropping");
            return Ok(());
        }

        let task_id_owned = task_id.to_string();
        let task = self
            .store
            .update(
                task_id,
                Box::new(move |mut t| {
                    t.status = TaskStatus {
                        state: TaskState::Working,
                        message: t.status.message.clone(),
                        timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    };
                    t
                }),
            )
            .await?;

        let cancel_flag = self.cancel_registry.register(task_id).await;
        let event_queue = self.queues.create_or_tap(task_id).await;

        let message = task.history.as_ref().and_then(|h| h.last()).cloned();
        let context = RequestContext {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            message,
            task: Some(task.clone()),
            configuration: None,
            related_tasks: Vec::new(),
            metadata: task.metadata.clone(),
            call_context: None,
            cancel_flag,
        };

        // A single background consumer persists every event the executor
        // publishes, and stops once it observes a final event — mirrors
        // `EventConsumer::next_event`'s own terminal detection so this loop
        // doesn't need its own copy of that logic.
        let mut consumer = EventConsumer::new(event_queue.clone());
        let store = Arc::clone(&self.store);
        let persist_task_id = task_id_owned.clone();
        let persist_handle = tokio::spawn(async move {
            while let Some(event) = consumer.next_event().await {
                if let Err(err) = apply_and_save(store.as_ref(), &persist_task_id, &event).await {
                    warn!(task_id = %persist_task_id, error = %err, "failed to persist task event");
                }
            }
        });

        let executor = Arc::clone(&self.executor);
        let run_queue = event_queue.clone();
        let handle = tokio::spawn(async move { executor.execute(context, run_queue).await });
        let result = handle.await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.publish_failure(&event_queue, &task, &err.to_string(), None)
                    .await;
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    let payload = join_err.into_panic();
                    let stack = panic_payload_to_string(&payload);
                    self.publish_failure(
                        &event_queue,
                        &task,
                        "agent executor panicked",
                        Some(stack),
                    )
                    .await;
                } else {
                    let detail = format!("agent executor task was cancelled: {join_err}");
                    self.publish_failure(&event_queue, &task, &detail, None)
                        .await;
                }
            }
        }

        let _ = persist_handle.await;
        self.cancel_registry.unregister(task_id).await;
        let _ = self.queues.close(task_id).await;

        Ok(())
    }

    /// Publish a terminal `failed` status update directly to the event
    /// queue. Used only when the executor itself errors or panics without
    /// having published its own terminal status — the background consumer
    /// spawned in `process_one` persists it like any other event.
    ///
    /// `panic_stack` is `Some` only for an executor panic, and is folded into
    /// `metadata.execution_stats` along with the `WorkerCrash` error code so
    /// the crash is diagnosable from the persisted task alone.
    async fn publish_failure(
        &self,
        event_queue: &super::event_queue::EventQueue,
        task: &crate::types::Task,
        detail: &str,
        panic_stack: Option<String>,
    ) {
        let message = Message::agent(
            uuid::Uuid::new_v4().to_string(),
            format!("task execution failed: {detail}"),
        );
        let metadata = panic_stack.map(|stack| {
            serde_json::json!({
                "code": crate::error::WORKER_CRASH,
                "execution_stats": { "panic": stack },
            })
        });
        let event = StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            kind: "status-update".to_string(),
            status: TaskStatus {
                state: TaskState::Failed,
                message: Some(message),
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            },
            r#final: true,
            metadata,
        });
        if let Err(err) = event_queue.enqueue_event(event).await {
            warn!(task_id = %task.id, error = %err, "failed to publish failure event");
        }
    }
}

/// Extract a printable message from a caught panic payload.
///
/// `std::panic::catch_unwind`-style payloads are almost always `&'static str`
/// or `String` (from `panic!("...")` / `.expect(...)`), but the type is
/// `Any` in general.
fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
