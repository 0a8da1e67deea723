//! Workflow Parser
//!
//! Turns a YAML workflow definition plus JSON inputs into a
//! [`WorkflowGraph`]. Dependencies come from two places: explicit
//! `previous` entries and `${call.output}` references in inputs and
//! scatter collections.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;

use super::expression::{parse_reference, InputExpr, OutputExpr};
use super::graph::{CallNode, DependencyGraph, OutputReference, ScatterNode, WorkflowGraph};
use super::model::{CallDefinition, Fqn, WorkflowDefinition, WorkflowSources};
use super::validator::{validate_definition, ValidationError};

/// Why a workflow could not be parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to parse workflow source: {0}")]
    Syntax(#[from] serde_yaml::Error),

    #[error("failed to parse workflow inputs: {0}")]
    Inputs(String),

    #[error("workflow is invalid: {}", describe(.0))]
    Invalid(Vec<ValidationError>),
}

fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parser collaborator used by the workflow manager.
pub trait WorkflowParser: Send + Sync {
    fn parse(&self, source: &str, inputs_json: Option<&str>) -> Result<WorkflowGraph, ParseError>;
}

/// Parses the YAML definition format.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlWorkflowParser;

impl WorkflowParser for YamlWorkflowParser {
    fn parse(&self, source: &str, inputs_json: Option<&str>) -> Result<WorkflowGraph, ParseError> {
        parse_workflow(source, inputs_json)
    }
}

/// Reads workflow sources from disk.
pub fn load_sources(
    workflow_path: &Path,
    inputs_path: Option<&Path>,
    options_path: Option<&Path>,
) -> std::io::Result<WorkflowSources> {
    info!("Loading workflow from: {}", workflow_path.display());

    let mut sources = WorkflowSources::new(fs::read_to_string(workflow_path)?);
    if let Some(path) = inputs_path {
        debug!("Loading inputs from: {}", path.display());
        sources.inputs_json = Some(fs::read_to_string(path)?);
    }
    if let Some(path) = options_path {
        debug!("Loading options from: {}", path.display());
        sources.options_json = Some(fs::read_to_string(path)?);
    }
    Ok(sources)
}

/// Parses and validates a workflow.
///
/// This function:
/// 1. Parses the YAML definition
/// 2. Validates its structure
/// 3. Applies inputs over declared defaults
/// 4. Resolves input references and output expressions
/// 5. Builds the dependency graph (also detects cycles)
pub fn parse_workflow(source: &str, inputs_json: Option<&str>) -> Result<WorkflowGraph, ParseError> {
    let definition: WorkflowDefinition = serde_yaml::from_str(source)?;
    info!(
        "Parsed workflow '{}' with {} calls",
        definition.name,
        definition.calls.len()
    );

    let provided = parse_inputs(inputs_json, &definition.name)?;

    let errors = validate_definition(&definition);
    if !errors.is_empty() {
        return Err(ParseError::Invalid(errors));
    }

    let mut errors = Vec::new();
    let inputs = resolve_inputs(&definition, provided, &mut errors);
    let calls: BTreeMap<Fqn, CallNode> = definition
        .calls
        .iter()
        .map(|call| {
            let node = build_call(&definition, call, &mut errors);
            (node.fqn.clone(), node)
        })
        .collect();
    let outputs = resolve_outputs(&definition, &calls, &mut errors);

    if !errors.is_empty() {
        return Err(ParseError::Invalid(errors));
    }

    let graph = DependencyGraph::build(populate_dependencies(&definition, &calls))
        .map_err(|e| ParseError::Invalid(vec![e]))?;

    info!(
        "Workflow '{}' validated: {} calls, {} outputs",
        definition.name,
        calls.len(),
        outputs.len()
    );

    Ok(WorkflowGraph {
        name: definition.name,
        calls,
        graph,
        inputs,
        outputs,
    })
}

/// Parses the inputs JSON. Keys may be `name` or `<workflow>.name`.
fn parse_inputs(inputs_json: Option<&str>, workflow: &str) -> Result<BTreeMap<String, Value>, ParseError> {
    let text = match inputs_json.map(str::trim) {
        None | Some("") => return Ok(BTreeMap::new()),
        Some(text) => text,
    };

    let value: Value = serde_json::from_str(text).map_err(|e| ParseError::Inputs(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ParseError::Inputs("inputs must be a JSON object".to_string()));
    };

    let prefix = format!("{}.", workflow);
    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let name = key.strip_prefix(&prefix).map(str::to_string).unwrap_or(key);
            (name, value)
        })
        .collect())
}

fn resolve_inputs(
    definition: &WorkflowDefinition,
    mut provided: BTreeMap<String, Value>,
    errors: &mut Vec<ValidationError>,
) -> BTreeMap<String, Value> {
    let mut inputs = BTreeMap::new();

    for (name, default) in &definition.inputs {
        match provided.remove(name).or_else(|| default.clone()) {
            Some(value) => {
                inputs.insert(name.clone(), value);
            }
            None => errors.push(ValidationError::MissingInput(name.clone())),
        }
    }

    for name in provided.keys() {
        warn!("Ignoring input '{}': not declared by the workflow", name);
    }

    inputs
}

fn build_call(
    definition: &WorkflowDefinition,
    call: &CallDefinition,
    errors: &mut Vec<ValidationError>,
) -> CallNode {
    let scatter_variable = call.scatter.as_ref().map(|s| s.variable.as_str());

    let inputs = call
        .inputs
        .iter()
        .map(|(name, value)| {
            let expr = resolve_reference(definition, call, value, scatter_variable, errors);
            (name.clone(), expr)
        })
        .collect();

    let scatter = call.scatter.as_ref().map(|scatter| ScatterNode {
        variable: scatter.variable.clone(),
        collection: resolve_reference(definition, call, &scatter.over, None, errors),
    });

    let outputs = call
        .outputs
        .iter()
        .filter_map(|(name, text)| match OutputExpr::parse(text) {
            Ok(expr) => Some((name.clone(), expr)),
            Err(message) => {
                errors.push(ValidationError::InvalidOutputExpression {
                    call: call.id.clone(),
                    output: name.clone(),
                    message,
                });
                None
            }
        })
        .collect();

    CallNode {
        fqn: Fqn::call(&definition.name, &call.id),
        definition: call.clone(),
        inputs,
        outputs,
        scatter,
    }
}

fn resolve_reference(
    definition: &WorkflowDefinition,
    call: &CallDefinition,
    value: &Value,
    scatter_variable: Option<&str>,
    errors: &mut Vec<ValidationError>,
) -> InputExpr {
    let Some(segments) = parse_reference(value) else {
        return InputExpr::Literal(value.clone());
    };

    match segments.as_slice() {
        [name] if Some(*name) == scatter_variable => InputExpr::ScatterItem(name.to_string()),
        [name] if definition.inputs.contains_key(*name) => InputExpr::WorkflowInput(name.to_string()),
        [name] => {
            errors.push(ValidationError::UnknownInput {
                call: call.id.clone(),
                input: name.to_string(),
            });
            InputExpr::Literal(Value::Null)
        }
        [upstream, output] => match definition.get_call(upstream) {
            None => {
                errors.push(ValidationError::InvalidReference {
                    call: call.id.clone(),
                    reference: upstream.to_string(),
                });
                InputExpr::Literal(Value::Null)
            }
            Some(source) if !source.outputs.contains_key(*output) => {
                errors.push(ValidationError::UnknownOutput {
                    call: call.id.clone(),
                    reference: format!("{}.{}", upstream, output),
                });
                InputExpr::Literal(Value::Null)
            }
            Some(source) => InputExpr::CallOutput {
                call: Fqn::call(&definition.name, &source.id),
                output: output.to_string(),
            },
        },
        _ => {
            errors.push(ValidationError::InvalidReference {
                call: call.id.clone(),
                reference: segments.join("."),
            });
            InputExpr::Literal(Value::Null)
        }
    }
}

/// Collects each call's upstream set from explicit `previous` entries and
/// from output references.
fn populate_dependencies(
    definition: &WorkflowDefinition,
    calls: &BTreeMap<Fqn, CallNode>,
) -> Vec<(Fqn, BTreeSet<Fqn>)> {
    calls
        .values()
        .map(|node| {
            let mut upstream: BTreeSet<Fqn> = node
                .definition
                .previous
                .iter()
                .map(|id| Fqn::call(&definition.name, id))
                .collect();

            let referenced = node
                .inputs
                .values()
                .chain(node.scatter.as_ref().map(|s| &s.collection))
                .filter_map(InputExpr::upstream);
            upstream.extend(referenced.cloned());

            if !upstream.is_empty() {
                debug!("Call '{}' depends on: {:?}", node.fqn, upstream);
            }
            (node.fqn.clone(), upstream)
        })
        .collect()
}

/// Resolves declared workflow outputs; an empty list exports every call output.
///
/// Output names are only checked once the run finishes, so a typo surfaces
/// as an output lookup failure rather than a parse error.
fn resolve_outputs(
    definition: &WorkflowDefinition,
    calls: &BTreeMap<Fqn, CallNode>,
    errors: &mut Vec<ValidationError>,
) -> Vec<OutputReference> {
    if definition.outputs.is_empty() {
        return calls
            .values()
            .flat_map(|node| {
                node.outputs.keys().map(|name| OutputReference {
                    fqn: node.fqn.output(name),
                    call: node.fqn.clone(),
                    name: name.clone(),
                })
            })
            .collect();
    }

    let prefix = format!("{}.", definition.name);
    let known: HashSet<&str> = definition.calls.iter().map(|c| c.id.as_str()).collect();
    let mut outputs = Vec::new();

    for declared in &definition.outputs {
        let short = declared.trim();
        let short = short.strip_prefix(&prefix).unwrap_or(short);
        match short.split_once('.') {
            Some((call, name)) if known.contains(call) && !name.is_empty() => {
                let call = Fqn::call(&definition.name, call);
                outputs.push(OutputReference {
                    fqn: call.output(name),
                    call,
                    name: name.to_string(),
                });
            }
            _ => errors.push(ValidationError::UnknownOutputCall(declared.clone())),
        }
    }

    outputs
}
