//! Call Status and Failure Taxonomy

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::CallKey;

/// Output name -> value for one finished call instance.
pub type CallOutputs = BTreeMap<String, Value>;

/// Output FQN -> value for a whole workflow.
pub type WorkflowOutputs = BTreeMap<String, Value>;

/// Lifecycle of one call attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "status", content = "detail")]
pub enum CallExecutionStatus {
    #[default]
    NotStarted,
    Starting,
    Running,
    Done(CallOutputs),
    Failed(CallFailure),
    Aborted,
}

impl CallExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_) | Self::Aborted)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// Position in the lifecycle; transitions never move backwards.
    pub fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Done(_) | Self::Failed(_) | Self::Aborted => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Done(_) => "Done",
            Self::Failed(_) => "Failed",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for CallExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a call attempt failed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    #[error("SubmissionError: {0}")]
    Submission(String),

    #[error("BackendUnavailableError: {0}")]
    BackendUnavailable(String),

    #[error("NonZeroExitError: job exited with return code {rc}")]
    NonZeroExit { rc: i32 },

    #[error("OutputEvaluationError: output '{output}': {message}")]
    OutputEvaluation { output: String, message: String },

    #[error("InputResolutionError: {0}")]
    InputResolution(String),

    #[error("CallCrashedError: {0}")]
    Crashed(String),
}

impl CallFailure {
    /// Short error kind used in failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submission(_) => "SubmissionError",
            Self::BackendUnavailable(_) => "BackendUnavailableError",
            Self::NonZeroExit { .. } => "NonZeroExitError",
            Self::OutputEvaluation { .. } => "OutputEvaluationError",
            Self::InputResolution(_) => "InputResolutionError",
            Self::Crashed(_) => "CallCrashedError",
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Submission(_) | Self::BackendUnavailable(_) | Self::NonZeroExit { .. }
        )
    }
}

/// Why a workflow run failed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Error)]
pub enum WorkflowFailure {
    #[error("call {key} failed: {cause}")]
    Call { key: CallKey, cause: CallFailure },

    #[error("OutputLookupError: workflow output '{fqn}' was not produced")]
    OutputLookup { fqn: String },

    #[error("calls never became runnable: {}", .calls.join(", "))]
    Unreachable { calls: Vec<String> },

    #[error("workflow supervisor crashed: {0}")]
    SupervisorCrashed(String),
}
