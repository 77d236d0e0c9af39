//! Task manager — the engine's top-level entry point.
//!
//! Resolves an incoming message to the task it belongs to (a fresh task, a
//! direct task-id continuation, or a context-id-based resume of an
//! `input-required` task via [`super::context_join`]), hands the task id to
//! the [`super::task_queue::TaskQueue`] for a worker to pick up, and exposes
//! the read/stream/cancel operations the request handlers need.
//!
//! Distinct from [`super::worker_pool::WorkerPool`]: this is the submission
//! side of the engine, the pool is the execution side. Both share the same
//! [`TaskStore`], [`QueueManager`], and [`CancelRegistry`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{A2AError, A2AResult};
use crate::types::{Message, StreamResponse, Task, TaskState, TaskStatus};

use super::context_join;
use super::event_queue::{EventConsumer, EventQueue, QueueManager};
use super::state_machine::{is_terminal, validate_transition};
use super::task_queue::TaskQueue;
use super::task_store::{TaskListParams, TaskListResponse, TaskStore};
use super::worker_pool::CancelRegistry;

/// How long [`TaskManager::cancel`] waits, and how often it polls the store,
/// for a worker-owned task to settle into a terminal state after signaling.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CANCEL_POLL_ATTEMPTS: u32 = 100;

/// Top-level task lifecycle engine.
///
/// Mirrors Python SDK's `TaskManager` in spirit (owning task resolution and
/// persistence) but, unlike the per-request original, is a single
/// long-lived object shared by every request: task identity lives entirely
/// in the [`TaskStore`], not in `self`.
pub struct TaskManager {
    task_store: Arc<dyn TaskStore>,
    task_queue: Arc<dyn TaskQueue>,
    queues: Arc<dyn QueueManager>,
    cancel_registry: Arc<CancelRegistry>,
}

impl TaskManager {
    /// Build a task manager around the shared engine state.
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        task_queue: Arc<dyn TaskQueue>,
        queues: Arc<dyn QueueManager>,
        cancel_registry: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            task_store,
            task_queue,
            queues,
            cancel_registry,
        }
    }

    /// Resolve `message` to the task it belongs to, persist it, and enqueue
    /// it for a worker if it isn't already being worked.
    ///
    /// Resolution order:
    /// 1. `message.task_id` set — continue that exact task.
    /// 2. `message.context_id` set — resume the context's `input-required`
    ///    task, if one exists.
    /// 3. Otherwise — start a brand-new task in a fresh context.
    pub async fn submit(
        &self,
        message: Message,
        metadata: Option<serde_json::Value>,
    ) -> A2AResult<Task> {
        let (task, already_working) = self.resolve_submission(message, metadata).await?;
        if !already_working {
            self.enqueue(&task.id).await?;
        }
        Ok(task)
    }

    /// Submit `message`, returning both the task and a subscription to its
    /// event stream that was established before the task was enqueued.
    ///
    /// A plain `submit` followed by a separate `stream` call leaves a window
    /// between enqueue and subscribe during which a worker can dequeue and
    /// start publishing — `tokio::sync::broadcast` only delivers to receivers
    /// that existed at send time, so any event published in that window is
    /// lost to this subscriber. Subscribing first closes that window.
    pub async fn submit_and_stream(
        &self,
        message: Message,
        metadata: Option<serde_json::Value>,
    ) -> A2AResult<(Task, broadcast::Receiver<StreamResponse>)> {
        let (task, already_working) = self.resolve_submission(message, metadata).await?;
        let queue = self.queues.create_or_tap(&task.id).await;
        let rx = queue.subscribe();
        if !already_working {
            self.enqueue(&task.id).await?;
        }
        Ok((task, rx))
    }

    /// Submit `message`, returning both the task and an [`EventConsumer`]
    /// subscribed before the task was enqueued. See
    /// [`TaskManager::submit_and_stream`] for why subscribe-before-enqueue
    /// matters; blocking `message/send` needs the same guarantee to reliably
    /// detect the terminal event.
    pub async fn submit_and_consume(
        &self,
        message: Message,
        metadata: Option<serde_json::Value>,
    ) -> A2AResult<(Task, EventConsumer)> {
        let (task, already_working) = self.resolve_submission(message, metadata).await?;
        let queue = self.queues.create_or_tap(&task.id).await;
        let consumer = EventConsumer::new(queue);
        if !already_working {
            self.enqueue(&task.id).await?;
        }
        Ok((task, consumer))
    }

    /// Resolve `message` to its task (creating or continuing one) and
    /// persist it, but do not enqueue it — callers that need to observe
    /// every event the eventual worker publishes must subscribe to the
    /// task's queue first and enqueue afterward themselves.
    ///
    /// Returns the task together with whether it was already checked out by
    /// a worker (in which case the caller must not enqueue it again).
    async fn resolve_submission(
        &self,
        message: Message,
        metadata: Option<serde_json::Value>,
    ) -> A2AResult<(Task, bool)> {
        if let Some(task_id) = message.task_id.clone() {
            let task = self
                .task_store
                .get(&task_id)
                .await?
                .ok_or_else(|| A2AError::task_not_found(format!("task {} not found", task_id)))?;
            return self.continue_task(task, message).await;
        }

        if let Some(context_id) = message.context_id.clone() {
            if let Some(resumable) = context_join::find_resumable(self.task_store.as_ref(), &context_id).await? {
                return self.continue_task(resumable, message).await;
            }
            return self.create_task(context_id, message, metadata).await;
        }

        self.create_task(Uuid::new_v4().to_string(), message, metadata)
            .await
    }

    /// Attach `message` to an existing task, without enqueueing.
    ///
    /// Returns `(task, already_working)`; the caller enqueues unless the
    /// task was already checked out by a worker.
    async fn continue_task(&self, task: Task, message: Message) -> A2AResult<(Task, bool)> {
        if is_terminal(task.status.state) {
            return Err(A2AError::invalid_params(format!(
                "task {} is in terminal state {}",
                task.id, task.status.state
            )));
        }

        let already_working = task.status.state == TaskState::Working;
        let task_id = task.id.clone();
        let updated = self
            .task_store
            .update(
                &task_id,
                Box::new(move |mut t| {
                    if let Some(ref status_msg) = t.status.message {
                        let history = t.history.get_or_insert_with(Vec::new);
                        history.push(status_msg.clone());
                        t.status.message = None;
                    }
                    let history = t.history.get_or_insert_with(Vec::new);
                    history.push(message);
                    t
                }),
            )
            .await?;

        if already_working {
            info!(task_id = %updated.id, "attached message to in-flight task");
        }

        Ok((updated, already_working))
    }

    /// Create and persist a brand-new task, without enqueueing.
    async fn create_task(
        &self,
        context_id: String,
        message: Message,
        metadata: Option<serde_json::Value>,
    ) -> A2AResult<(Task, bool)> {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            context_id,
            kind: "task".to_string(),
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            },
            artifacts: None,
            history: Some(vec![message]),
            metadata,
        };

        self.task_store.create(task.clone()).await?;
        info!(task_id = %task.id, context_id = %task.context_id, "created task");
        Ok((task, false))
    }

    async fn enqueue(&self, task_id: &str) -> A2AResult<()> {
        self.task_queue.enqueue(task_id.to_string()).await
    }

    /// Look up a task by id.
    pub async fn get(&self, task_id: &str) -> A2AResult<Option<Task>> {
        self.task_store.get(task_id).await
    }

    /// List tasks matching the given parameters.
    pub async fn list(&self, params: &TaskListParams) -> A2AResult<TaskListResponse> {
        self.task_store.list(params).await
    }

    /// Resolve the event queue a caller should subscribe to for a task.
    ///
    /// If the task has already reached a terminal state, the worker pool has
    /// already closed and removed its queue — a late subscriber instead gets
    /// a one-shot queue that will carry just the final `Task` snapshot, once
    /// the caller subscribes to it, rather than tapping (and reviving) a
    /// queue nothing will ever publish to again. The snapshot is handed back
    /// rather than published here, since publishing before the caller has
    /// subscribed would mean the broadcast has no receiver to deliver it to.
    async fn resolve_queue(&self, task_id: &str) -> A2AResult<(EventQueue, Option<Task>)> {
        let task = self
            .task_store
            .get(task_id)
            .await?
            .ok_or_else(|| A2AError::task_not_found(format!("task {} not found", task_id)))?;

        if is_terminal(task.status.state) {
            Ok((EventQueue::with_default_capacity(), Some(task)))
        } else {
            Ok((self.queues.create_or_tap(task_id).await, None))
        }
    }

    /// Subscribe to the stream of events for a task.
    ///
    /// See [`TaskManager::resolve_queue`] for the terminal-task special case.
    pub async fn stream(&self, task_id: &str) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        let (queue, snapshot) = self.resolve_queue(task_id).await?;
        let rx = queue.subscribe();
        if let Some(task) = snapshot {
            queue.publish(StreamResponse::Task(task))?;
        }
        Ok(rx)
    }

    /// Build an [`EventConsumer`] for a task — used by blocking callers
    /// (`message/send`) that need terminal-event detection rather than a
    /// raw receiver.
    pub async fn consumer_for(&self, task_id: &str) -> A2AResult<EventConsumer> {
        let (queue, snapshot) = self.resolve_queue(task_id).await?;
        let consumer = EventConsumer::new(queue.clone());
        if let Some(task) = snapshot {
            queue.publish(StreamResponse::Task(task))?;
        }
        Ok(consumer)
    }

    /// Request cancellation of a task.
    ///
    /// If a worker currently owns the task, signals its cooperative-cancel
    /// flag and waits for the worker's own terminal status update to land in
    /// the store (the worker's background persistence subscriber is the
    /// sole writer of that update — this never re-applies it itself, to
    /// avoid double-applying the same event). If no worker owns it (still
    /// queued, or waiting in `input-required`), transitions it directly.
    pub async fn cancel(&self, task_id: &str) -> A2AResult<Task> {
        let task = self
            .task_store
            .get(task_id)
            .await?
            .ok_or_else(|| A2AError::task_not_found(format!("task {} not found", task_id)))?;

        if is_terminal(task.status.state) {
            return Err(A2AError::task_not_cancelable(format!(
                "task {} cannot be canceled - current state: {}",
                task_id, task.status.state
            )));
        }

        if self.cancel_registry.signal(task_id).await {
            return self.await_cancellation(task_id).await;
        }

        validate_transition(task.status.state, TaskState::Canceled)?;
        let updated = self
            .task_store
            .update(
                task_id,
                Box::new(move |mut t| {
                    t.status = TaskStatus {
                        state: TaskState::Canceled,
                        message: None,
                        timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    };
                    t
                }),
            )
            .await?;
        Ok(updated)
    }

    async fn await_cancellation(&self, task_id: &str) -> A2AResult<Task> {
        for _ in 0..CANCEL_POLL_ATTEMPTS {
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
            if let Some(task) = self.task_store.get(task_id).await? {
                if is_terminal(task.status.state) {
                    return Ok(task);
                }
            } else {
                warn!(task_id, "task vanished while awaiting cancellation");
                return Err(A2AError::task_not_found(format!(
                    "task {} not found",
                    task_id
                )));
            }
        }
        Err(A2AError::internal_error(format!(
            "task {} did not reach a terminal state after cancellation was requested",
            task_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::event_queue::InMemoryQueueManager;
    use crate::server::task_queue::InMemoryTaskQueue;
    use crate::server::task_store::InMemoryTaskStore;
    use tokio::sync::watch;

    fn harness() -> TaskManager {
        let (_tx, rx) = watch::channel(false);
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task_queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(16, rx));
        let queues: Arc<dyn QueueManager> = Arc::new(InMemoryQueueManager::new());
        let cancel_registry = Arc::new(CancelRegistry::new());
        TaskManager::new(task_store, task_queue, queues, cancel_registry)
    }

    #[tokio::test]
    async fn submit_without_ids_creates_fresh_task_and_enqueues() {
        let mgr = harness();
        let task = mgr
            .submit(Message::user("m1", "hello"), None)
            .await
            .unwrap();

        assert_eq!(task.status.state, TaskState::Submitted);
        assert_eq!(task.history.unwrap().len(), 1);
        assert_eq!(mgr.task_queue.size(), 1);
    }

    #[tokio::test]
    async fn submit_with_unknown_task_id_fails() {
        let mgr = harness();
        let mut msg = Message::user("m1", "hello");
        msg.task_id = Some("nope".to_string());

        let err = mgr.submit(msg, None).await.unwrap_err();
        assert_eq!(err.code(), crate::error::TASK_NOT_FOUND);
    }

    #[tokio::test]
    async fn submit_with_context_id_resumes_input_required_task() {
        let mgr = harness();
        let first = mgr
            .submit(Message::user("m1", "start"), None)
            .await
            .unwrap();

        mgr.task_store
            .update(
                &first.id,
                Box::new(|mut t| {
                    t.status.state = TaskState::InputRequired;
                    t
                }),
            )
            .await
            .unwrap();

        let mut follow_up = Message::user("m2", "here's the answer");
        follow_up.context_id = Some(first.context_id.clone());

        let resumed = mgr.submit(follow_up, None).await.unwrap();
        assert_eq!(resumed.id, first.id);
        assert_eq!(resumed.history.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn submit_with_context_id_and_no_resumable_task_creates_new() {
        let mgr = harness();
        let mut msg = Message::user("m1", "hello");
        msg.context_id = Some("ctx-fresh".to_string());

        let task = mgr.submit(msg, None).await.unwrap();
        assert_eq!(task.context_id, "ctx-fresh");
        assert_eq!(task.status.state, TaskState::Submitted);
    }

    #[tokio::test]
    async fn submit_against_terminal_task_is_rejected() {
        let mgr = harness();
        let task = mgr
            .submit(Message::user("m1", "hello"), None)
            .await
            .unwrap();
        mgr.task_store
            .update(
                &task.id,
                Box::new(|mut t| {
                    t.status.state = TaskState::Completed;
                    t
                }),
            )
            .await
            .unwrap();

        let mut follow_up = Message::user("m2", "too late");
        follow_up.task_id = Some(task.id.clone());

        let err = mgr.submit(follow_up, None).await.unwrap_err();
        assert_eq!(err.code(), crate::error::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn cancel_queued_task_transitions_directly_to_canceled() {
        let mgr = harness();
        let task = mgr
            .submit(Message::user("m1", "hello"), None)
            .await
            .unwrap();

        let canceled = mgr.cancel(&task.id).await.unwrap();
        assert_eq!(canceled.status.state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn cancel_unknown_task_fails() {
        let mgr = harness();
        let err = mgr.cancel("nope").await.unwrap_err();
        assert_eq!(err.code(), crate::error::TASK_NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_terminal_task_is_rejected() {
        let mgr = harness();
        let task = mgr
            .submit(Message::user("m1", "hello"), None)
            .await
            .unwrap();
        mgr.task_store
            .update(
                &task.id,
                Box::new(|mut t| {
                    t.status.state = TaskState::Completed;
                    t
                }),
            )
            .await
            .unwrap();

        let err = mgr.cancel(&task.id).await.unwrap_err();
        assert_eq!(err.code(), crate::error::TASK_NOT_CANCELABLE);
    }

    #[tokio::test]
    async fn stream_on_terminal_task_yields_one_shot_snapshot() {
        let mgr = harness();
        let task = mgr
            .submit(Message::user("m1", "hello"), None)
            .await
            .unwrap();
        mgr.task_store
            .update(
                &task.id,
                Box::new(|mut t| {
                    t.status.state = TaskState::Completed;
                    t
                }),
            )
            .await
            .unwrap();

        let mut rx = mgr.stream(&task.id).await.unwrap();
        let event = rx.recv().await.unwrap();
        match event {
            StreamResponse::Task(t) => assert_eq!(t.id, task.id),
            _ => panic!("expected a Task snapshot"),
        }
    }

    #[tokio::test]
    async fn stream_on_unknown_task_fails() {
        let mgr = harness();
        let err = mgr.stream("nope").await.unwrap_err();
        assert_eq!(err.code(), crate::error::TASK_NOT_FOUND);
    }

    /// The returned receiver must already be subscribed before the task is
    /// enqueued — a worker racing to publish an event right after enqueue
    /// must not be able to outrun the subscription.
    #[tokio::test]
    async fn submit_and_stream_subscribes_before_enqueueing() {
        let mgr = harness();
        let (task, mut rx) = mgr
            .submit_and_stream(Message::user("m1", "hello"), None)
            .await
            .unwrap();

        let queue = mgr.queues.get(&task.id).await.unwrap();
        queue
            .publish(StreamResponse::Task(task.clone()))
            .unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            StreamResponse::Task(t) => assert_eq!(t.id, task.id),
            _ => panic!("expected the published Task snapshot"),
        }
    }

    #[tokio::test]
    async fn submit_and_consume_subscribes_before_enqueueing() {
        let mgr = harness();
        let (task, mut consumer) = mgr
            .submit_and_consume(Message::user("m1", "hello"), None)
            .await
            .unwrap();

        let queue = mgr.queues.get(&task.id).await.unwrap();
        queue
            .publish(StreamResponse::Task(task.clone()))
            .unwrap();

        let event = consumer.next_event().await.unwrap();
        match event {
            StreamResponse::Task(t) => assert_eq!(t.id, task.id),
            _ => panic!("expected the published Task snapshot"),
        }
    }
}
