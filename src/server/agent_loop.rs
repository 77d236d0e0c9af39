//! Agent loop — the engine's built-in [`AgentExecutor`].
//!
//! Drives an LLM through iterative tool calls until it produces a final
//! answer, asks for input, hits the iteration cap, or is cancelled.
//!
//! Grounded on a streaming agent's turn loop: push all assistant tool-call
//! entries first, spawn every tool call concurrently, await them back in
//! call-index order (never completion order) so history stays
//! deterministic, and convert a panicking tool task into a tool-error result
//! rather than failing the whole iteration.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{A2AError, A2AResult};
use crate::types::Part;

use super::agent_executor::{AgentExecutor, RequestContext};
use super::event_queue::EventQueue;
use super::task_updater::TaskUpdater;
use super::tool_registry::{ToolRegistry, INPUT_REQUIRED_TOOL_NAME};

// ---------------------------------------------------------------------------
// LLM-facing conversation representation
// ---------------------------------------------------------------------------

/// Role of an entry in the LLM-facing conversation.
///
/// Distinct from [`crate::types::Role`] (the A2A wire role, which only
/// distinguishes `user`/`agent`) — the agent loop needs a system prompt and
/// tool-call/tool-result turns that have no A2A equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model within one iteration.
#[derive(Debug, Clone)]
pub struct ChatToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry in the LLM-facing conversation history.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Set on `Tool`-role entries: which call this result answers.
    pub tool_call_id: Option<String>,
    /// Set on `Assistant`-role entries that requested tool calls.
    pub tool_calls: Vec<ChatToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_tool_call(call: ChatToolCall) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: String::new(),
            tool_call_id: None,
            tool_calls: vec![call],
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Converts an A2A history entry into its LLM-facing form — text parts
/// joined, non-text parts dropped (file/data parts are a future extension
/// this loop doesn't yet forward to the model).
fn chat_message_from_a2a(message: &crate::types::Message) -> ChatMessage {
    let text = crate::utils::get_text_parts(&message.parts).join("\n");
    match message.role {
        crate::types::Role::User => ChatMessage::user(text),
        crate::types::Role::Agent | crate::types::Role::Unspecified => {
            ChatMessage::assistant(text)
        }
    }
}

// ---------------------------------------------------------------------------
// LlmClient — the pluggable model provider contract
// ---------------------------------------------------------------------------

/// A tool declaration sent to the model for one chat call.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Request passed to [`LlmClient::chat`].
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
}

/// Token accounting reported by the provider, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One event yielded while streaming a single chat completion.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// An incremental chunk of assistant text.
    TextDelta(String),
    /// An incremental chunk of a tool call, keyed by the provider's
    /// zero-based call index within this turn (tool-call arguments commonly
    /// arrive fragmented across multiple stream events).
    ToolCallDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: Option<String>,
    },
    /// Token usage for the turn, if the provider reports it.
    Usage(Usage),
    /// The turn is complete.
    Done,
    /// The provider reported an error mid-stream.
    Error { message: String, transient: bool },
}

/// Stream of [`ChatEvent`]s for one chat completion.
pub type ChatStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Pluggable LLM provider contract the agent loop drives.
///
/// Implementations adapt a concrete provider's wire protocol (OpenAI-style
/// SSE, Anthropic's event stream, a local model server, …) to this uniform
/// event stream. No default implementation ships — the engine is provider-agnostic.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Start a chat completion, returning its event stream.
    async fn chat(&self, request: ChatRequest) -> A2AResult<ChatStream>;
}

// ---------------------------------------------------------------------------
// Tool-call accumulation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    args_buf: String,
}

impl PendingToolCall {
    /// Finalize into a `ChatToolCall`, parsing accumulated argument
    /// fragments as JSON (substituting `{}` on empty/invalid input) and
    /// synthesizing an id if the provider never sent one.
    ///
    /// Returns `None` if the provider never supplied a tool name — such a
    /// fragment carries no actionable call and is dropped.
    fn finish(self, synthetic_index: usize) -> Option<ChatToolCall> {
        let name = self.name?;
        if name.is_empty() {
            return None;
        }

        let arguments = if self.args_buf.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|_| {
                warn!(
                    raw = %self.args_buf,
                    "tool call arguments failed to parse as JSON — substituting {{}}"
                );
                Value::Object(Default::default())
            })
        };

        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => format!("call_synthetic_{}", synthetic_index),
        };

        Some(ChatToolCall {
            id,
            name,
            arguments,
        })
    }
}

struct IterationOutcome {
    text: String,
    tool_calls: Vec<ChatToolCall>,
    usage: Option<Usage>,
}

/// Running totals published as `metadata.usage` / `metadata.execution_stats`
/// on every `iteration_completed` and terminal status update (§4.5, invariant
/// 7 — both accumulate monotonically across a task's lifetime).
#[derive(Debug, Clone, Copy, Default)]
struct CumulativeStats {
    iterations: u32,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl CumulativeStats {
    fn record(&mut self, usage: Option<Usage>) {
        self.iterations += 1;
        if let Some(usage) = usage {
            self.prompt_tokens += usage.prompt_tokens as u64;
            self.completion_tokens += usage.completion_tokens as u64;
            // Providers don't always report `total_tokens` as exactly
            // prompt + completion (cached-token discounts, reasoning
            // tokens), so sum what was reported rather than re-deriving it.
            self.total_tokens += usage.total_tokens as u64;
        }
    }

    fn to_metadata(self) -> Value {
        serde_json::json!({
            "usage": {
                "prompt_tokens": self.prompt_tokens,
                "completion_tokens": self.completion_tokens,
                "total_tokens": self.total_tokens,
            },
            "execution_stats": {
                "iterations": self.iterations,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// AgentLoopConfig
// ---------------------------------------------------------------------------

/// Tunables for [`AgentLoopExecutor`].
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Hard ceiling on LLM round-trips for a single task.
    ///
    /// Reaching this (including the boundary case of `0`, which means "no
    /// LLM call is ever allowed") fails the task with
    /// `Failed { code: IterationLimit }` rather than asking the model for a
    /// final wrap-up turn — forward progress isn't guaranteed once a task
    /// has already exhausted its iteration budget.
    pub max_chat_completion_iterations: u32,
    /// Retries for a transient `LlmError` before giving up.
    pub max_retries: u32,
    /// Maximum tool calls dispatched concurrently within one iteration.
    pub tool_call_concurrency: usize,
    /// History entries kept when building the prompt (oldest trimmed first).
    pub max_conversation_history: usize,
    /// Prepended as a `ChatRole::System` entry, if set.
    pub system_prompt: Option<String>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_chat_completion_iterations: 25,
            max_retries: 3,
            tool_call_concurrency: 8,
            max_conversation_history: 200,
            system_prompt: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentLoopExecutor
// ---------------------------------------------------------------------------

/// The engine's built-in [`AgentExecutor`]: iterates an LLM against a tool
/// registry until it produces a final answer.
pub struct AgentLoopExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    config: AgentLoopConfig,
}

impl AgentLoopExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>, config: AgentLoopConfig) -> Self {
        Self { llm, tools, config }
    }

    fn build_history(&self, context: &RequestContext) -> Vec<ChatMessage> {
        let mut history = Vec::new();
        if let Some(ref prompt) = self.config.system_prompt {
            history.push(ChatMessage::system(prompt.clone()));
        }
        if let Some(ref task) = context.task {
            if let Some(ref task_history) = task.history {
                history.extend(task_history.iter().map(chat_message_from_a2a));
            }
        }

        let floor = if self.config.system_prompt.is_some() { 1 } else { 0 };
        if history.len() > self.config.max_conversation_history + floor {
            let excess = history.len() - (self.config.max_conversation_history + floor);
            history.drain(floor..floor + excess);
        }
        history
    }

    async fn call_with_retry(&self, request: &ChatRequest) -> A2AResult<ChatStream> {
        let mut attempt = 0u32;
        loop {
            match self.llm.chat(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    let transient = matches!(&err, A2AError::LlmError { transient: true, .. });
                    attempt += 1;
                    if !transient || attempt > self.config.max_retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_millis(100u64 * 2u64.pow(attempt.min(6)));
                    warn!(attempt, ?backoff, "retrying transient LLM error");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Run one LLM round-trip, forwarding text deltas to `updater` as they
    /// stream in and accumulating tool-call fragments by provider index.
    async fn run_iteration(
        &self,
        history: &[ChatMessage],
        updater: &TaskUpdater,
    ) -> A2AResult<IterationOutcome> {
        // The `input_required` tool is always advertised, whether or not the
        // caller registered it — the agent loop intercepts it directly (see
        // `execute`) rather than dispatching it through `self.tools`.
        let input_required = super::tool_registry::input_required_tool();
        let mut tools: Vec<ToolSchema> = vec![ToolSchema {
            name: input_required.name.clone(),
            description: input_required.description.clone(),
            parameters: input_required.parameters.clone(),
        }];
        tools.extend(self.tools.list().into_iter().map(
            |(name, description, parameters)| ToolSchema {
                name: name.to_string(),
                description: description.to_string(),
                parameters: parameters.clone(),
            },
        ));

        let request = ChatRequest {
            messages: history.to_vec(),
            tools,
        };
        let mut stream = self.call_with_retry(&request).await?;

        let mut full_text = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut usage = None;

        while let Some(event) = stream.next().await {
            match event {
                ChatEvent::TextDelta(delta) => {
                    if !delta.is_empty() {
                        full_text.push_str(&delta);
                        updater
                            .delta(
                                Part::Text {
                                    text: delta,
                                    metadata: None,
                                },
                                None,
                            )
                            .await?;
                    }
                }
                ChatEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_fragment,
                } => {
                    let entry = pending.entry(index).or_default();
                    if let Some(id) = id {
                        entry.id = Some(id);
                    }
                    if let Some(name) = name {
                        entry.name = Some(name);
                    }
                    if let Some(fragment) = arguments_fragment {
                        entry.args_buf.push_str(&fragment);
                    }
                }
                ChatEvent::Usage(reported) => usage = Some(reported),
                ChatEvent::Done => break,
                ChatEvent::Error { message, transient } => {
                    return Err(A2AError::llm_error(message, transient));
                }
            }
        }

        let mut entries: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        entries.sort_by_key(|(index, _)| *index);
        let tool_calls = entries
            .into_iter()
            .enumerate()
            .filter_map(|(i, (_, pending))| pending.finish(i))
            .collect();

        Ok(IterationOutcome {
            text: full_text,
            tool_calls,
            usage,
        })
    }

    /// Dispatch every tool call in `calls` concurrently (bounded by
    /// `tool_call_concurrency`), then collect results back in call order.
    ///
    /// A panicking tool task becomes a `Part::ToolResult { is_error: true }`
    /// rather than failing the iteration — one bad tool shouldn't take the
    /// whole turn down.
    async fn dispatch_tool_calls(
        &self,
        calls: &[ChatToolCall],
        updater: &TaskUpdater,
    ) -> Vec<(String, Value, bool)> {
        let semaphore = Arc::new(Semaphore::new(self.config.tool_call_concurrency.max(1)));
        let mut tasks = Vec::with_capacity(calls.len());

        for call in calls {
            let tools = Arc::clone(&self.tools);
            let name = call.name.clone();
            let arguments = call.arguments.clone();
            let permit = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = permit
                    .acquire_owned()
                    .await
                    .expect("tool dispatch semaphore closed unexpectedly");
                tools.invoke(&name, arguments).await
            }));
        }

        let mut outputs = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let call_id = calls[i].id.clone();
            let (content, is_error) = match task.await {
                Ok(Ok(value)) => match super::tool_registry::check_result_size_ceiling(&value) {
                    Ok(()) => (value, false),
                    Err(err) => (serde_json::json!({ "error": err.to_string() }), true),
                },
                Ok(Err(err)) => (
                    serde_json::json!({ "error": err.to_string() }),
                    true,
                ),
                Err(join_err) => (
                    serde_json::json!({ "error": format!("tool task panicked: {}", join_err) }),
                    true,
                ),
            };

            if let Err(err) = updater
                .delta(
                    Part::ToolResult {
                        call_id: call_id.clone(),
                        content: content.clone(),
                        is_error,
                        metadata: None,
                    },
                    None,
                )
                .await
            {
                warn!(%err, "failed to publish tool-result delta");
            }

            outputs.push((call_id, content, is_error));
        }
        outputs
    }
}

#[async_trait]
impl AgentExecutor for AgentLoopExecutor {
    async fn execute(&self, context: RequestContext, event_queue: EventQueue) -> A2AResult<()> {
        let updater = TaskUpdater::new(
            event_queue,
            context.task_id.clone(),
            context.context_id.clone(),
        );
        updater.start_work(None).await?;

        if self.config.max_chat_completion_iterations == 0 {
            let message = updater.new_agent_message(
                vec![Part::Text {
                    text: "maxChatCompletionIterations is 0 — no model call is permitted"
                        .to_string(),
                    metadata: None,
                }],
                None,
            );
            updater.failed(Some(message)).await?;
            return Ok(());
        }

        let mut history = self.build_history(&context);
        if let Some(ref message) = context.message {
            history.push(chat_message_from_a2a(message));
        }

        let mut stats = CumulativeStats::default();
        let mut iteration = 0u32;
        loop {
            if context.is_cancelled() {
                updater.cancel(None).await?;
                return Ok(());
            }

            iteration += 1;
            if iteration > self.config.max_chat_completion_iterations {
                let message = updater.new_agent_message(
                    vec![Part::Text {
                        text: format!(
                            "reached the {}-iteration limit without a final answer",
                            self.config.max_chat_completion_iterations
                        ),
                        metadata: None,
                    }],
                    None,
                );
                updater.failed(Some(message)).await?;
                return Ok(());
            }

            let outcome = match self.run_iteration(&history, &updater).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let message = updater.new_agent_message(
                        vec![Part::Text {
                            text: err.to_string(),
                            metadata: None,
                        }],
                        None,
                    );
                    updater.failed(Some(message)).await?;
                    return Ok(());
                }
            };
            stats.record(outcome.usage);

            if !outcome.text.is_empty() {
                history.push(ChatMessage::assistant(outcome.text.clone()));
            }

            // An `input_required` call suspends the loop rather than being
            // dispatched as an ordinary tool — the agent is asking for
            // clarification, not doing work.
            let (mut input_requests, tool_calls): (Vec<_>, Vec<_>) = outcome
                .tool_calls
                .into_iter()
                .partition(|call| call.name == INPUT_REQUIRED_TOOL_NAME);

            if let Some(call) = input_requests.pop() {
                let prompt = call
                    .arguments
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let message = updater.new_agent_message(
                    vec![Part::Text {
                        text: prompt,
                        metadata: None,
                    }],
                    None,
                );
                updater
                    .iteration_completed(iteration, Some(message.clone()), Some(stats.to_metadata()))
                    .await?;
                updater.requires_input(Some(message), false).await?;
                return Ok(());
            }

            if tool_calls.is_empty() {
                let message = updater.new_agent_message(
                    vec![Part::Text {
                        text: outcome.text,
                        metadata: None,
                    }],
                    None,
                );
                updater
                    .iteration_completed(iteration, Some(message.clone()), Some(stats.to_metadata()))
                    .await?;
                updater.update_status(
                    crate::types::TaskState::Completed,
                    Some(message),
                    true,
                    Some(stats.to_metadata()),
                ).await?;
                return Ok(());
            }

            for call in &tool_calls {
                history.push(ChatMessage::assistant_tool_call(call.clone()));
            }

            let results = self.dispatch_tool_calls(&tool_calls, &updater).await;
            for (call_id, value, _is_error) in &results {
                history.push(ChatMessage::tool_result(call_id.clone(), value.to_string()));
            }

            if context.is_cancelled() {
                updater.cancel(None).await?;
                return Ok(());
            }

            updater
                .iteration_completed(iteration, None, Some(stats.to_metadata()))
                .await?;
        }
    }

    async fn cancel(&self, context: RequestContext, event_queue: EventQueue) -> A2AResult<()> {
        let updater = TaskUpdater::new(event_queue, context.task_id, context.context_id);
        updater.cancel(None).await
    }
}
