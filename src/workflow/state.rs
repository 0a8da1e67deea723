//! Workflow Run State
//!
//! Lifecycle of one workflow run. Succeeded, Failed and Aborted are
//! terminal; once a run reaches one of them it never changes again.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowState {
    Submitted,
    Running,
    /// Still running, but no new calls are started
    Aborting,
    Succeeded,
    Failed,
    Aborted,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Whether the run may move from `self` to `next`.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;

        match self {
            Submitted => matches!(next, Running | Failed | Aborted),
            Running => matches!(next, Aborting | Succeeded | Failed | Aborted),
            Aborting => matches!(next, Aborted | Failed),
            Succeeded | Failed | Aborted => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "Submitted",
            Self::Running => "Running",
            Self::Aborting => "Aborting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!WorkflowState::Submitted.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
        assert!(!WorkflowState::Aborting.is_terminal());
        assert!(WorkflowState::Succeeded.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Aborted.is_terminal());
    }

    #[test]
    fn test_allowed_transitions() {
        use WorkflowState::*;

        assert!(Submitted.can_transition_to(Running));
        assert!(Submitted.can_transition_to(Aborted));
        assert!(Running.can_transition_to(Aborting));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Aborting.can_transition_to(Aborted));

        assert!(!Submitted.can_transition_to(Succeeded));
        assert!(!Aborting.can_transition_to(Succeeded));
        assert!(!Aborting.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states_never_change() {
        use WorkflowState::*;

        for terminal in [Succeeded, Failed, Aborted] {
            for next in [Submitted, Running, Aborting, Succeeded, Failed, Aborted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
