//! Task event sink — applies streaming events to persisted task state.
//!
//! Both the blocking `message/send` path and the worker pool's background
//! persistence subscriber funnel every `StreamResponse` a task produces
//! through [`apply_event`], so the two paths can never disagree about what a
//! given event does to the stored `Task`.
//!
//! Extracted from what used to be `TaskManager::save_task_event` — the
//! mapping itself is unchanged, only its home.

use tracing::warn;

use crate::error::A2AResult;
use crate::types::{
    Artifact, Message, Part, Role, StreamResponse, Task, TaskArtifactUpdateEvent, TaskState,
};

use super::task_store::TaskStore;

/// Apply one `StreamResponse` event to `task`, mutating it in place.
///
/// Does not persist — callers own the store round-trip.
pub fn apply_event(task: &mut Task, event: &StreamResponse) {
    match event {
        StreamResponse::StatusUpdate(update) => {
            // Move the current status message to history before replacing it.
            if let Some(ref current_msg) = task.status.message {
                push_history(task, current_msg.clone());
            }

            if let Some(ref event_meta) = update.metadata {
                merge_metadata(task, event_meta);
            }

            task.status = update.status.clone();

            // A terminal status never sees a subsequent transition to move
            // its message into history on — fold it in here or it is lost,
            // stranded in `status.message` forever.
            if is_terminal(task.status.state) {
                if let Some(ref msg) = task.status.message {
                    push_history(task, msg.clone());
                }
            }
        }
        StreamResponse::ArtifactUpdate(update) => {
            append_artifact_to_task(task, update);
        }
        StreamResponse::Task(updated) => {
            *task = updated.clone();
        }
        StreamResponse::Message(msg) => {
            push_history(task, msg.clone());
        }
        StreamResponse::Delta(update) => {
            // Tool results don't ride on a status transition or an
            // iteration-completed message of their own — fold them into
            // history directly as they arrive, or they never land anywhere.
            if matches!(update.part, Part::ToolResult { .. }) {
                push_history(task, tool_result_message(task, update.part.clone()));
            }
        }
        StreamResponse::IterationCompleted(update) => {
            if let Some(ref message) = update.message {
                push_history(task, message.clone());
            }
        }
        StreamResponse::Error(err) => {
            task.status.state = TaskState::Failed;
            task.status.message = None;
            warn!(task_id = %task.id, code = err.code, message = %err.message, "task failed");
        }
    }
}

fn is_terminal(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
    )
}

/// Wraps a single streamed part (currently only used for `ToolResult`) as a
/// standalone history entry.
fn tool_result_message(task: &Task, part: Part) -> Message {
    Message {
        message_id: uuid::Uuid::new_v4().to_string(),
        role: Role::Agent,
        kind: "message".to_string(),
        parts: vec![part],
        context_id: Some(task.context_id.clone()),
        task_id: Some(task.id.clone()),
        metadata: None,
        extensions: None,
        reference_task_ids: None,
    }
}

/// Appends `message` to history unless it is a duplicate of the last entry
/// — the agent loop emits the same final message on both
/// `iteration-completed` and the terminal status update, and this is the
/// single place that would otherwise double-count it.
fn push_history(task: &mut Task, message: Message) {
    let history = task.history.get_or_insert_with(Vec::new);
    if history
        .last()
        .map(|m| m.message_id == message.message_id)
        .unwrap_or(false)
    {
        return;
    }
    history.push(message);
}

/// Load, apply, and save one event against `store`.
///
/// Returns `Ok(None)` if the task no longer exists — a lagging subscriber
/// can observe events for a task that was deleted (e.g. by a retention
/// sweep) out from under it.
pub async fn apply_and_save(
    store: &dyn TaskStore,
    task_id: &str,
    event: &StreamResponse,
) -> A2AResult<Option<Task>> {
    let Some(mut task) = store.get(task_id).await? else {
        return Ok(None);
    };
    apply_event(&mut task, event);
    store.save(task.clone()).await?;
    Ok(Some(task))
}

fn merge_metadata(task: &mut Task, event_meta: &serde_json::Value) {
    if let Some(ref mut task_meta) = task.metadata {
        if let (Some(task_obj), Some(event_obj)) =
            (task_meta.as_object_mut(), event_meta.as_object())
        {
            for (k, v) in event_obj {
                task_obj.insert(k.clone(), v.clone());
            }
        }
    } else {
        task.metadata = Some(event_meta.clone());
    }
}

/// Appends an artifact to a task based on an artifact update event.
///
/// Handles creating the artifacts list if it doesn't exist, adding new
/// artifacts, and appending parts to existing artifacts based on the
/// `append` flag.
///
/// Mirrors Python SDK's `append_artifact_to_task` from `a2a.utils.helpers`.
pub fn append_artifact_to_task(task: &mut Task, event: &TaskArtifactUpdateEvent) {
    let artifacts = task.artifacts.get_or_insert_with(Vec::new);

    let new_artifact: &Artifact = &event.artifact;
    let artifact_id = &new_artifact.artifact_id;
    let append_parts = event.append.unwrap_or(false);

    let existing_idx = artifacts.iter().position(|a| a.artifact_id == *artifact_id);

    if !append_parts {
        if let Some(idx) = existing_idx {
            artifacts[idx] = new_artifact.clone();
        } else {
            artifacts.push(new_artifact.clone());
        }
    } else if let Some(idx) = existing_idx {
        artifacts[idx].parts.extend(new_artifact.parts.clone());
    } else {
        warn!(
            artifact_id = %artifact_id,
            task_id = %task.id,
            "received append=true for nonexistent artifact — ignoring chunk"
        );
    }
}
