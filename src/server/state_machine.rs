//! Task state machine — the single source of truth for valid transitions.
//!
//! A pure validator with no storage of its own: both [`super::task_manager`]
//! and [`super::worker_pool`] call [`validate_transition`] immediately before
//! every [`super::task_store::TaskStore::update`] so neither path can drift
//! from the other's idea of what transitions are legal.

use crate::error::{A2AError, A2AResult};
use crate::types::TaskState;

/// Returns `true` if `state` is terminal — no further transitions are valid
/// out of it.
pub fn is_terminal(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
    )
}

/// Validate a proposed state transition.
///
/// Transition graph:
/// - `Submitted -> Working | Canceled | Rejected`
/// - `Working -> Completed | Failed | Canceled | InputRequired | AuthRequired`
/// - `InputRequired -> Working | Canceled`
/// - `AuthRequired -> Working | Canceled`
/// - terminal states (`Completed`, `Failed`, `Canceled`, `Rejected`) accept no
///   further transitions
///
/// `Unknown` is never a valid `to` state — it exists only for forward
/// compatibility when deserializing states this build doesn't recognize.
pub fn validate_transition(from: TaskState, to: TaskState) -> A2AResult<()> {
    if from == to {
        return Err(A2AError::already_terminal(format!(
            "task is already in state {:?}",
            from
        )));
    }

    if is_terminal(from) {
        return Err(A2AError::already_terminal(format!(
            "cannot transition out of terminal state {:?}",
            from
        )));
    }

    let allowed = match from {
        TaskState::Submitted => matches!(
            to,
            TaskState::Working | TaskState::Canceled | TaskState::Rejected
        ),
        TaskState::Working => matches!(
            to,
            TaskState::Completed
                | TaskState::Failed
                | TaskState::Canceled
                | TaskState::InputRequired
                | TaskState::AuthRequired
        ),
        TaskState::InputRequired | TaskState::AuthRequired => {
            matches!(to, TaskState::Working | TaskState::Canceled)
        }
        TaskState::Completed
        | TaskState::Failed
        | TaskState::Canceled
        | TaskState::Rejected
        | TaskState::Unknown => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(A2AError::invalid_params(format!(
            "invalid transition {:?} -> {:?}",
            from, to
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitted_to_working_is_valid() {
        assert!(validate_transition(TaskState::Submitted, TaskState::Working).is_ok());
    }

    #[test]
    fn working_to_input_required_and_back_is_valid() {
        assert!(validate_transition(TaskState::Working, TaskState::InputRequired).is_ok());
        assert!(validate_transition(TaskState::InputRequired, TaskState::Working).is_ok());
    }

    #[test]
    fn terminal_states_reject_all_further_transitions() {
        for terminal in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
            TaskState::Rejected,
        ] {
            let err = validate_transition(terminal, TaskState::Working).unwrap_err();
            assert_eq!(err.code(), crate::error::ALREADY_TERMINAL);
        }
    }

    #[test]
    fn submitted_cannot_jump_to_completed() {
        let err = validate_transition(TaskState::Submitted, TaskState::Completed).unwrap_err();
        assert_eq!(err.code(), crate::error::INVALID_PARAMS);
    }

    #[test]
    fn submitted_can_be_rejected_directly() {
        assert!(validate_transition(TaskState::Submitted, TaskState::Rejected).is_ok());
    }

    #[test]
    fn is_terminal_matches_transition_graph() {
        assert!(is_terminal(TaskState::Completed));
        assert!(!is_terminal(TaskState::Working));
        assert!(!is_terminal(TaskState::InputRequired));
    }
}
