//! Workflow Data Model
//!
//! Identifiers and definitions shared by the parser, the scheduler and the
//! call actors.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: greet
//! inputs:
//!   names: ~
//!   greeting: Hello
//! calls:
//!   - id: say
//!     command: echo "{greeting}, {who}!"
//!     inputs:
//!       greeting: ${greeting}
//!     scatter:
//!       variable: who
//!       over: ${names}
//!     outputs:
//!       line: stdout()
//!
//!   - id: collect
//!     command: echo {lines} > all.txt
//!     inputs:
//!       lines: ${say.line}
//!     outputs:
//!       all: read_lines("all.txt")
//!     max_retries: 2
//! outputs:
//!   - collect.all
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Fully qualified name of a call: `<workflow>.<call>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fqn(String);

impl Fqn {
    /// Builds the FQN of a call declared in a workflow.
    pub fn call(workflow: &str, call: &str) -> Self {
        Self(format!("{}.{}", workflow, call))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The call's local name (the last segment of the FQN).
    pub fn call_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// FQN of one of this call's outputs.
    pub fn output(&self, name: &str) -> String {
        format!("{}.{}", self.0, name)
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fqn {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Fqn {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One call instance: a call plus its scatter index (`None` for singletons).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub fqn: Fqn,
    pub index: Option<usize>,
}

impl InstanceKey {
    pub fn new(fqn: Fqn, index: Option<usize>) -> Self {
        Self { fqn, index }
    }

    /// The call key of a given attempt of this instance.
    pub fn attempt(&self, attempt: u32) -> CallKey {
        CallKey {
            fqn: self.fqn.clone(),
            index: self.index,
            attempt,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]", self.fqn, index),
            None => write!(f, "{}", self.fqn),
        }
    }
}

/// Identifies one execution attempt of one call instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallKey {
    pub fqn: Fqn,
    pub index: Option<usize>,
    pub attempt: u32,
}

impl CallKey {
    pub fn new(fqn: Fqn, index: Option<usize>, attempt: u32) -> Self {
        Self {
            fqn,
            index,
            attempt,
        }
    }

    pub fn instance(&self) -> InstanceKey {
        InstanceKey::new(self.fqn.clone(), self.index)
    }

    /// Same call instance, next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            fqn: self.fqn.clone(),
            index: self.index,
            attempt: self.attempt + 1,
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{}:{}", self.fqn, index, self.attempt),
            None => write!(f, "{}:NA:{}", self.fqn, self.attempt),
        }
    }
}

/// Resource and environment requirements handed to the backend.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RuntimeAttributes {
    /// Name of the backend that should run the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Container image for container backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Backend-specific attributes passed through untouched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
}

/// Return codes, besides 0, that count as success.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ContinueOnReturnCode {
    /// `true` accepts every return code
    Any(bool),
    Code(i32),
    Codes(Vec<i32>),
}

impl ContinueOnReturnCode {
    pub fn accepts(&self, rc: i32) -> bool {
        if rc == 0 {
            return true;
        }
        match self {
            Self::Any(flag) => *flag,
            Self::Code(code) => *code == rc,
            Self::Codes(codes) => codes.contains(&rc),
        }
    }
}

impl Default for ContinueOnReturnCode {
    fn default() -> Self {
        Self::Codes(Vec::new())
    }
}

/// Scatter declaration: one call instance per element of `over`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScatterDefinition {
    /// Name bound to the current element inside the call
    pub variable: String,

    /// Collection to scatter over (literal array or `${...}` reference)
    pub over: Value,
}

/// A single call as written in the workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallDefinition {
    /// Unique identifier of the call within the workflow
    pub id: String,

    /// Command template with `{input}` placeholders
    pub command: String,

    /// Input values: literals or `${input}` / `${call.output}` references
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,

    /// Output name -> output expression
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,

    #[serde(default)]
    pub runtime: RuntimeAttributes,

    /// IDs of calls that must finish first, beyond those implied by references
    #[serde(deserialize_with = "single_or_vec", default)]
    pub previous: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scatter: Option<ScatterDefinition>,

    #[serde(default)]
    pub continue_on_return_code: ContinueOnReturnCode,

    /// Retry budget; falls back to the workflow options, then the engine config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl CallDefinition {
    /// Creates a call with the given id and command template.
    ///
    /// # Example
    ///
    /// ```
    /// use pipewright::workflow::CallDefinition;
    ///
    /// let call = CallDefinition::new("align", "bwa mem ref.fa {reads} > out.sam")
    ///     .with_input("reads", "${reads}")
    ///     .with_output("sam", "file(\"out.sam\")")
    ///     .with_max_retries(2);
    /// assert_eq!(call.outputs.len(), 1);
    /// ```
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            command: command.into().trim().to_string(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            runtime: RuntimeAttributes::default(),
            previous: Vec::new(),
            scatter: None,
            continue_on_return_code: ContinueOnReturnCode::default(),
            max_retries: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), expression.into());
        self
    }

    /// Adds an explicit dependency on another call.
    pub fn depends_on(mut self, call_id: impl Into<String>) -> Self {
        self.previous.push(call_id.into());
        self
    }

    pub fn scatter_over(mut self, variable: impl Into<String>, over: impl Into<Value>) -> Self {
        self.scatter = Some(ScatterDefinition {
            variable: variable.into(),
            over: over.into(),
        });
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn continue_on(mut self, codes: ContinueOnReturnCode) -> Self {
        self.continue_on_return_code = codes;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeAttributes) -> Self {
        self.runtime = runtime;
        self
    }
}

/// A complete workflow definition as written by the user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow name, prefix of every FQN
    pub name: String,

    /// Declared inputs with optional defaults
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Option<Value>>,

    pub calls: Vec<CallDefinition>,

    /// Declared workflow outputs (`call.output`); empty means every call output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            inputs: BTreeMap::new(),
            calls: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Adds a call to the workflow.
    pub fn add_call(&mut self, call: CallDefinition) -> Result<(), String> {
        if self.calls.iter().any(|c| c.id == call.id) {
            return Err(format!("Call '{}' already exists", call.id));
        }
        self.calls.push(call);
        Ok(())
    }

    /// Declares a workflow input, optionally with a default value.
    pub fn declare_input(&mut self, name: impl Into<String>, default: Option<Value>) {
        self.inputs.insert(name.into(), default);
    }

    pub fn get_call(&self, id: &str) -> Option<&CallDefinition> {
        self.calls.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Renders the definition back to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// What happens to the rest of a run when a call fails for good.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop dispatching and abort running calls
    #[default]
    #[serde(alias = "NoNewCalls")]
    FailFast,

    /// Keep running everything not downstream of the failure
    #[serde(alias = "ContinueWhilePossible")]
    FailSlow,
}

/// Raw sources of one submission, kept so a restart can re-parse them.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkflowSources {
    pub workflow_source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_json: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options_json: Option<String>,
}

impl WorkflowSources {
    pub fn new(workflow_source: impl Into<String>) -> Self {
        Self {
            workflow_source: workflow_source.into(),
            inputs_json: None,
            options_json: None,
        }
    }

    pub fn with_inputs(mut self, inputs_json: impl Into<String>) -> Self {
        self.inputs_json = Some(inputs_json.into());
        self
    }

    pub fn with_options(mut self, options_json: impl Into<String>) -> Self {
        self.options_json = Some(options_json.into());
        self
    }
}

/// Per-run options supplied as JSON next to the workflow source.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkflowOptions {
    /// Backend for calls that do not name one
    #[serde(default)]
    pub backend: Option<String>,

    #[serde(default, alias = "workflow_failure_mode")]
    pub failure_mode: Option<FailureMode>,

    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl WorkflowOptions {
    /// Parses the options JSON; missing or blank options mean defaults.
    pub fn parse(json: Option<&str>) -> Result<Self, serde_json::Error> {
        match json.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(text) => serde_json::from_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_creation() {
        let call = CallDefinition::new("test", "echo {msg}")
            .with_input("msg", "hello")
            .with_output("out", "stdout()")
            .with_max_retries(2);

        assert_eq!(call.id, "test");
        assert_eq!(call.inputs.get("msg"), Some(&json!("hello")));
        assert_eq!(call.outputs.get("out").map(String::as_str), Some("stdout()"));
        assert_eq!(call.max_retries, Some(2));
    }

    #[test]
    fn test_call_depends_on_multiple() {
        let call = CallDefinition::new("test", "echo test")
            .depends_on("parent1")
            .depends_on("parent2");

        assert_eq!(call.previous, vec!["parent1", "parent2"]);
    }

    #[test]
    fn test_workflow_add_call_rejects_duplicates() {
        let mut workflow = WorkflowDefinition::new("wf");
        let call = CallDefinition::new("a", "echo a");

        assert!(workflow.add_call(call.clone()).is_ok());
        assert!(workflow.add_call(call).is_err());
        assert_eq!(workflow.len(), 1);
        assert!(workflow.get_call("a").is_some());
        assert!(workflow.get_call("b").is_none());
    }

    #[test]
    fn test_previous_accepts_single_string() {
        let yaml = "id: b\ncommand: echo b\nprevious: a\n";
        let call: CallDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(call.previous, vec!["a"]);
    }

    #[test]
    fn test_continue_on_return_code_forms() {
        let any: ContinueOnReturnCode = serde_yaml::from_str("true").unwrap();
        let single: ContinueOnReturnCode = serde_yaml::from_str("3").unwrap();
        let list: ContinueOnReturnCode = serde_yaml::from_str("[1, 2]").unwrap();

        assert!(any.accepts(42));
        assert!(single.accepts(3));
        assert!(!single.accepts(4));
        assert!(list.accepts(2));
        assert!(!list.accepts(3));
        assert!(ContinueOnReturnCode::default().accepts(0));
        assert!(!ContinueOnReturnCode::default().accepts(1));
        assert!(!ContinueOnReturnCode::Any(false).accepts(1));
    }

    #[test]
    fn test_call_key_display_and_attempts() {
        let key = CallKey::new(Fqn::call("wf", "align"), Some(2), 1);
        assert_eq!(key.to_string(), "wf.align:2:1");

        let retry = key.next_attempt();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.instance(), key.instance());

        let single = CallKey::new(Fqn::call("wf", "merge"), None, 3);
        assert_eq!(single.to_string(), "wf.merge:NA:3");
        assert_eq!(single.instance().to_string(), "wf.merge");
    }

    #[test]
    fn test_fqn_helpers() {
        let fqn = Fqn::call("wf", "align");
        assert_eq!(fqn.as_str(), "wf.align");
        assert_eq!(fqn.call_name(), "align");
        assert_eq!(fqn.output("bam"), "wf.align.bam");
    }

    #[test]
    fn test_workflow_id_roundtrip() {
        let id = WorkflowId::new();
        let parsed: WorkflowId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<WorkflowId>().is_err());
    }

    #[test]
    fn test_workflow_options_parse() {
        assert_eq!(WorkflowOptions::parse(None).unwrap(), WorkflowOptions::default());
        assert_eq!(WorkflowOptions::parse(Some("  ")).unwrap(), WorkflowOptions::default());

        let options = WorkflowOptions::parse(Some(
            r#"{"backend": "docker", "workflow_failure_mode": "ContinueWhilePossible", "max_retries": 2}"#,
        ))
        .unwrap();
        assert_eq!(options.backend.as_deref(), Some("docker"));
        assert_eq!(options.failure_mode, Some(FailureMode::FailSlow));
        assert_eq!(options.max_retries, Some(2));

        assert!(WorkflowOptions::parse(Some("{not json")).is_err());
    }

    #[test]
    fn test_failure_mode_names() {
        let fast: FailureMode = serde_yaml::from_str("fail_fast").unwrap();
        let no_new_calls: FailureMode = serde_yaml::from_str("NoNewCalls").unwrap();
        assert_eq!(fast, FailureMode::FailFast);
        assert_eq!(no_new_calls, FailureMode::FailFast);
        assert_eq!(FailureMode::default(), FailureMode::FailFast);
    }

    #[test]
    fn test_definition_yaml_roundtrip_keeps_calls() {
        let mut workflow = WorkflowDefinition::new("wf");
        workflow.declare_input("name", Some(json!("world")));
        workflow
            .add_call(CallDefinition::new("hello", "echo {name}").with_input("name", "${name}"))
            .unwrap();

        let yaml = workflow.to_yaml().unwrap();
        let parsed: WorkflowDefinition = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, workflow);
    }
}
