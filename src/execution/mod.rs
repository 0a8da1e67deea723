//! Workflow Execution Module
//!
//! Runs parsed workflows on backends.
//!
//! # Architecture
//!
//! - [`manager`]: Accepts submissions and owns the registry of runs
//! - [`supervisor`]: One task per run; dispatches calls and applies the failure policy
//! - [`call`]: One task per call instance; submits, polls, retries
//! - [`status`]: Call statuses and failure reasons

pub mod call;
pub mod manager;
pub mod status;
pub mod supervisor;

pub use call::{CallActor, CallEvent};
pub use manager::{ManagerError, WorkflowManager};
pub use status::{CallExecutionStatus, CallFailure, CallOutputs, WorkflowFailure, WorkflowOutputs};
pub use supervisor::{CallLogs, RestoredCalls, WorkflowSnapshot, WorkflowSupervisor};
