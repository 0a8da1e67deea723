//! Workflow Validation
//!
//! Structural checks on a workflow definition, run before references are
//! resolved:
//! - Workflow and call field validation
//! - Duplicate and malformed call IDs
//! - Explicit `previous` references
//! - Scatter declarations

use std::collections::HashSet;

use log::{debug, info};
use thiserror::Error;

use super::model::{CallDefinition, WorkflowDefinition};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Workflow has no calls")]
    EmptyWorkflow,

    #[error("Workflow has no name")]
    EmptyWorkflowName,

    #[error("Duplicate call ID: '{0}'")]
    DuplicateCallId(String),

    #[error("Call has empty or whitespace-only ID")]
    EmptyCallId,

    #[error("Call ID '{0}' may only contain letters, digits, '_' and '-'")]
    InvalidCallId(String),

    #[error("Call '{0}' has no command specified")]
    EmptyCommand(String),

    #[error("Call '{call}' references unknown call '{reference}'")]
    InvalidReference { call: String, reference: String },

    #[error("Call '{call}' references unknown workflow input '{input}'")]
    UnknownInput { call: String, input: String },

    #[error("Call '{call}' references output '{reference}' which is not declared")]
    UnknownOutput { call: String, reference: String },

    #[error("Required workflow input '{0}' was not provided")]
    MissingInput(String),

    #[error("Call '{call}' has an invalid scatter: {message}")]
    InvalidScatter { call: String, message: String },

    #[error("Call '{call}' has an invalid expression for output '{output}': {message}")]
    InvalidOutputExpression {
        call: String,
        output: String,
        message: String,
    },

    #[error("Workflow output '{0}' does not name a known call")]
    UnknownOutputCall(String),

    #[error("Workflow contains cyclic dependencies between calls: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

/// Call IDs become FQN segments, so they cannot contain dots or spaces.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validates a single call's fields.
fn validate_call(call: &CallDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if call.id.trim().is_empty() {
        errors.push(ValidationError::EmptyCallId);
        return errors; // Can't validate further without ID
    }

    if !is_valid_identifier(&call.id) {
        errors.push(ValidationError::InvalidCallId(call.id.clone()));
    }

    if call.command.trim().is_empty() {
        errors.push(ValidationError::EmptyCommand(call.id.clone()));
    }

    if let Some(scatter) = &call.scatter {
        if !is_valid_identifier(&scatter.variable) {
            errors.push(ValidationError::InvalidScatter {
                call: call.id.clone(),
                message: format!("'{}' is not a valid variable name", scatter.variable),
            });
        } else if call.inputs.contains_key(&scatter.variable) {
            errors.push(ValidationError::InvalidScatter {
                call: call.id.clone(),
                message: format!(
                    "variable '{}' shadows an input of the same name",
                    scatter.variable
                ),
            });
        }
    }

    if call.previous.iter().any(|p| p == &call.id) {
        errors.push(ValidationError::CyclicDependency(vec![call.id.clone()]));
    }

    if call.previous.is_empty() && call.inputs.is_empty() && call.scatter.is_none() {
        debug!("Call '{}' has no dependencies", call.id);
    }

    errors
}

/// Validates the structure of a workflow definition.
///
/// Performs the following checks:
/// 1. Workflow has a name and at least one call
/// 2. No duplicate call IDs
/// 3. All calls have valid fields
/// 4. All `previous` entries point to existing calls
///
/// Returns every problem found rather than stopping at the first one.
pub fn validate_definition(workflow: &WorkflowDefinition) -> Vec<ValidationError> {
    info!("Validating workflow with {} calls", workflow.calls.len());

    let mut errors = Vec::new();

    if workflow.name.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowName);
    }

    if workflow.calls.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for call in &workflow.calls {
        if !call.id.trim().is_empty() && !seen_ids.insert(call.id.as_str()) {
            errors.push(ValidationError::DuplicateCallId(call.id.clone()));
        }
    }

    for call in &workflow.calls {
        errors.extend(validate_call(call));

        for prev_id in &call.previous {
            if !seen_ids.contains(prev_id.as_str()) {
                errors.push(ValidationError::InvalidReference {
                    call: call.id.clone(),
                    reference: prev_id.clone(),
                });
            }
        }
    }

    errors
}
