//! Request handler — coordinates agent execution, task storage, and event delivery.
//!
//! Mirrors Python SDK's `RequestHandler(ABC)` and `DefaultRequestHandler` from
//! `a2a.server.request_handlers`.
//!
//! The [`RequestHandler`] trait defines the interface that the axum integration
//! layer calls for each JSON-RPC method. [`DefaultRequestHandler`] provides
//! the standard implementation, delegating task resolution and submission to
//! a [`TaskManager`] and execution to a [`WorkerPool`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::error::{A2AError, A2AResult};
use crate::types::{SendMessageResponse, StreamResponse, Task, TaskState};

use super::agent_executor::AgentExecutor;
use super::event_queue::{EventConsumer, InMemoryQueueManager};
use super::state_machine::is_terminal;
use super::task_manager::TaskManager;
use super::task_queue::{InMemoryTaskQueue, TaskQueue};
use super::task_store::{TaskListParams, TaskListResponse, TaskStore};
use super::worker_pool::{CancelRegistry, WorkerPool};

/// How many worker loops a [`DefaultRequestHandler`] spawns by default.
const DEFAULT_WORKER_COUNT: usize = 4;

/// Capacity of the intake queue between submission and the worker pool.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How long a blocking `message/send` waits, after its own event consumer
/// reports a terminal event, for the worker pool's persistence subscriber to
/// have actually written that state to the store.
const POST_TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(25);
const POST_TERMINAL_POLL_ATTEMPTS: u32 = 40;

/// Parameters for `message/send` and `message/stream`.
#[derive(Debug, Clone)]
pub struct SendMessageParams {
    /// The message to send to the agent.
    pub message: crate::types::Message,

    /// Optional configuration for the send operation.
    pub configuration: Option<SendMessageConfiguration>,

    /// Optional metadata attached to the request.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Configuration options for message sending.
#[derive(Debug, Clone)]
pub struct SendMessageConfiguration {
    /// Accepted output MIME types / modes.
    pub accepted_output_modes: Option<Vec<String>>,

    /// If `true`, the server should block until the task completes.
    /// If `false` or `None`, the server may return immediately with a
    /// `submitted` task.
    pub blocking: Option<bool>,

    /// Maximum number of history messages to include in the response.
    pub history_length: Option<usize>,

    /// Push notification configuration.
    pub push_notification_config: Option<serde_json::Value>,
}

/// Parameters for `tasks/get`.
#[derive(Debug, Clone)]
pub struct GetTaskParams {
    /// The task ID to retrieve.
    pub id: String,

    /// Maximum number of history messages to include.
    pub history_length: Option<usize>,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/cancel`.
#[derive(Debug, Clone)]
pub struct CancelTaskParams {
    /// The task ID to cancel.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeToTaskParams {
    /// The task ID to subscribe to.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Trait for handling A2A JSON-RPC requests.
///
/// Each method corresponds to an A2A JSON-RPC method. The axum integration
/// layer dispatches incoming requests to these methods.
///
/// Mirrors Python SDK's `RequestHandler(ABC)` from
/// `a2a.server.request_handlers.request_handler`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle `message/send` — execute agent logic and return the completed task or message.
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse>;

    /// Handle `message/stream` — execute agent logic and return an event stream.
    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>>;

    /// Handle `tasks/get` — retrieve a task by ID.
    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/list` — list tasks matching filter criteria.
    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse>;

    /// Handle `tasks/cancel` — cancel a running task.
    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/resubscribe` — re-subscribe to events for a running task.
    ///
    /// Allows a client to re-attach to a running streaming task's event stream.
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        let _ = params;
        Err(A2AError::UnsupportedOperation {
            message: "tasks/resubscribe is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/subscribe` — subscribe to events for an existing task.
    async fn on_subscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>>;

    /// Handle `tasks/pushNotificationConfig/set`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_set_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/get`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_get_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/list`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_list_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/delete`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_delete_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<()> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }
}

/// Default request handler — standard implementation wiring the task engine
/// to the JSON-RPC surface.
///
/// Owns the whole submission-to-execution pipeline:
/// - [`TaskManager`] resolves incoming messages to tasks and enqueues them
/// - [`WorkerPool`] dequeues and drives them through the configured
///   [`AgentExecutor`], on [`DEFAULT_WORKER_COUNT`] worker loops
/// - [`CancelRegistry`] and the shared [`super::event_queue::QueueManager`]
///   connect the two sides
///
/// The `_queue_shutdown` sender exists purely to keep the task queue's
/// shutdown channel alive for the handler's lifetime — dropping it would
/// immediately wake every worker loop into shutting down.
pub struct DefaultRequestHandler {
    task_manager: Arc<TaskManager>,
    task_store: Arc<dyn TaskStore>,
    cancel_registry: Arc<CancelRegistry>,
    _worker_handles: Vec<tokio::task::JoinHandle<()>>,
    _queue_shutdown: watch::Sender<bool>,
}

impl DefaultRequestHandler {
    /// Create a new default request handler, spawning its worker pool.
    pub fn new(executor: Arc<dyn AgentExecutor>, task_store: Arc<dyn TaskStore>) -> Self {
        Self::with_worker_count(executor, task_store, DEFAULT_WORKER_COUNT)
    }

    /// Create a new default request handler with an explicit worker count.
    pub fn with_worker_count(
        executor: Arc<dyn AgentExecutor>,
        task_store: Arc<dyn TaskStore>,
        worker_count: usize,
    ) -> Self {
        let (queue_shutdown_tx, queue_shutdown_rx) = watch::channel(false);
        let task_queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(
            DEFAULT_QUEUE_CAPACITY,
            queue_shutdown_rx,
        ));
        let queues = Arc::new(InMemoryQueueManager::new());
        let cancel_registry = Arc::new(CancelRegistry::new());

        let task_manager = Arc::new(TaskManager::new(
            Arc::clone(&task_store),
            Arc::clone(&task_queue),
            queues.clone(),
            Arc::clone(&cancel_registry),
        ));

        let pool = Arc::new(WorkerPool::new(
            task_queue,
            Arc::clone(&task_store),
            queues,
            executor,
            Arc::clone(&cancel_registry),
        ));
        let worker_handles = pool.spawn(worker_count);

        Self {
            task_manager,
            task_store,
            cancel_registry,
            _worker_handles: worker_handles,
            _queue_shutdown: queue_shutdown_tx,
        }
    }

    /// Drain a task's event consumer until a terminal event, then read back
    /// the persisted task — the worker pool's own background subscriber is
    /// the one writing that state, so this polls briefly for it to land
    /// rather than racing it.
    async fn await_final_task(
        &self,
        task_id: &str,
        mut consumer: EventConsumer,
    ) -> A2AResult<Task> {
        while consumer.next_event().await.is_some() {}

        for _ in 0..POST_TERMINAL_POLL_ATTEMPTS {
            if let Some(task) = self.task_store.get(task_id).await? {
                if is_terminal(task.status.state) || task.status.state == TaskState::InputRequired
                {
                    return Ok(task);
                }
            }
            tokio::time::sleep(POST_TERMINAL_POLL_INTERVAL).await;
        }

        self.task_store
            .get(task_id)
            .await?
            .ok_or_else(|| A2AError::task_not_found(format!("task {} not found", task_id)))
    }

    /// Trim task history to the requested length.
    ///
    /// Mirrors Python SDK's `apply_history_length`:
    /// - Only trims if `max_length` is `Some` AND > 0 AND history exists.
    /// - Keeps the most recent N messages (tail).
    fn trim_history(task: &mut Task, max_length: Option<usize>) {
        if let Some(max) = max_length {
            if max > 0 {
                if let Some(ref mut history) = task.history {
                    if history.len() > max {
                        let start = history.len() - max;
                        *history = history.split_off(start);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for DefaultRequestHandler {
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse> {
        let blocking = params
            .configuration
            .as_ref()
            .and_then(|c| c.blocking)
            .unwrap_or(true);
        let history_length = params.configuration.as_ref().and_then(|c| c.history_length);

        let (task, consumer) = self
            .task_manager
            .submit_and_consume(params.message, params.metadata)
            .await?;

        if !blocking {
            return Ok(SendMessageResponse::Task(task));
        }

        let mut final_task = self.await_final_task(&task.id, consumer).await?;
        Self::trim_history(&mut final_task, history_length);
        Ok(SendMessageResponse::Task(final_task))
    }

    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        let (_task, rx) = self
            .task_manager
            .submit_and_stream(params.message, params.metadata)
            .await?;
        Ok(rx)
    }

    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task> {
        let mut task = self
            .task_manager
            .get(&params.id)
            .await?
            .ok_or_else(|| A2AError::task_not_found(params.id.clone()))?;

        Self::trim_history(&mut task, params.history_length);
        Ok(task)
    }

    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse> {
        self.task_manager.list(&params).await
    }

    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task> {
        let canceled = self.task_manager.cancel(&params.id).await?;

        if canceled.status.state != TaskState::Canceled {
            return Err(A2AError::task_not_cancelable(format!(
                "task {} settled into {} instead of canceled",
                params.id, canceled.status.state
            )));
        }

        Ok(canceled)
    }

    async fn on_subscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        self.task_manager.stream(&params.id).await
    }

    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        self.task_manager.stream(&params.id).await
    }
}
