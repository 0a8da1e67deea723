//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating workflows, and the bookkeeping used to schedule their calls.
//!
//! # Structure
//!
//! - [`model`]: Definitions, identifiers and call keys
//! - [`parser`]: YAML parsing into a [`WorkflowGraph`]
//! - [`validator`]: Validation rules for definitions
//! - [`expression`]: Input references, command templates, output expressions
//! - [`graph`]: Resolved call graph with dependency order
//! - [`planner`]: Runnable instances, scatter expansion and output lookup
//! - [`state`]: Workflow run lifecycle

pub mod expression;
pub mod graph;
pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use expression::{render_template, InputExpr, OutputContext, OutputExpr};
pub use graph::{CallNode, DependencyGraph, OutputReference, ScatterNode, WorkflowDescriptor, WorkflowGraph};
pub use model::{
    CallDefinition, CallKey, ContinueOnReturnCode, FailureMode, Fqn, InstanceKey, RuntimeAttributes,
    ScatterDefinition, WorkflowDefinition, WorkflowId, WorkflowOptions, WorkflowSources,
};
pub use parser::{load_sources, parse_workflow, ParseError, WorkflowParser, YamlWorkflowParser};
pub use planner::{CallSnapshot, ExecutionPlanner};
pub use state::WorkflowState;
pub use validator::ValidationError;
