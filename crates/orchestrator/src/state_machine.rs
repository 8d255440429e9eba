use stepflow_core::RunStatus;

use crate::error::{OrchestratorError, Result};

/// Legal moves between run statuses.
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn validate_transition(from: &RunStatus, to: &RunStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &RunStatus) -> Vec<RunStatus> {
        match from {
            RunStatus::InProgress => vec![
                RunStatus::InProgress,
                RunStatus::Blocked,
                RunStatus::WaitingHuman,
                RunStatus::Completed,
                RunStatus::Failed,
            ],
            // Halted runs move only on operator action: resume or cancel.
            RunStatus::Blocked | RunStatus::WaitingHuman => {
                vec![RunStatus::InProgress, RunStatus::Failed]
            }
            RunStatus::Completed | RunStatus::Failed => vec![],
        }
    }

    pub fn can_transition(from: &RunStatus, to: &RunStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    pub fn is_resumable(status: &RunStatus) -> bool {
        status.is_halted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(RunStateMachine::can_transition(
            &RunStatus::InProgress,
            &RunStatus::WaitingHuman
        ));
        assert!(RunStateMachine::can_transition(
            &RunStatus::InProgress,
            &RunStatus::Completed
        ));
        assert!(RunStateMachine::can_transition(
            &RunStatus::Blocked,
            &RunStatus::InProgress
        ));
        assert!(RunStateMachine::can_transition(
            &RunStatus::WaitingHuman,
            &RunStatus::Failed
        ));
    }

    #[test]
    fn test_terminal_statuses_are_final() {
        for to in [
            RunStatus::InProgress,
            RunStatus::Blocked,
            RunStatus::WaitingHuman,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert!(!RunStateMachine::can_transition(&RunStatus::Completed, &to));
            assert!(!RunStateMachine::can_transition(&RunStatus::Failed, &to));
        }
    }

    #[test]
    fn test_halted_runs_do_not_complete_on_their_own() {
        assert!(!RunStateMachine::can_transition(
            &RunStatus::WaitingHuman,
            &RunStatus::Completed
        ));
        assert!(!RunStateMachine::can_transition(
            &RunStatus::Blocked,
            &RunStatus::WaitingHuman
        ));
        assert!(RunStateMachine::is_resumable(&RunStatus::Blocked));
        assert!(!RunStateMachine::is_resumable(&RunStatus::InProgress));
    }
}
