//! Context join — resolves a task-id-less follow-up message to the task it
//! should resume.
//!
//! A message that carries a `contextId` but no `taskId` is ambiguous: is it
//! the first turn of a brand-new task, or the answer to a question an
//! `input-required` task in that context is waiting on? [`find_resumable`]
//! answers that by looking at what's actually sitting in `input-required`
//! within the context.

use crate::error::A2AResult;
use crate::types::{Task, TaskState};

use super::task_store::TaskStore;

/// Find the task within `context_id` that a task-id-less follow-up message
/// should resume, if any.
///
/// Only `input-required` tasks are resumable — a `working` task is still
/// being driven by its own worker and will see history changes at its next
/// iteration boundary, and terminal tasks are done. If a context somehow has
/// more than one `input-required` task (unusual — it means an agent asked
/// more than one outstanding question across sibling tasks), the most
/// recently updated one wins, since that's the one most likely to be what
/// the user is replying to.
pub async fn find_resumable(store: &dyn TaskStore, context_id: &str) -> A2AResult<Option<Task>> {
    let tasks = store.list_by_context(context_id).await?;
    let resumable = tasks
        .into_iter()
        .filter(|t| t.status.state == TaskState::InputRequired)
        .max_by(|a, b| a.status.timestamp.cmp(&b.status.timestamp));
    Ok(resumable)
}
