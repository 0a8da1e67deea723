//! Backend Adapters
//!
//! A backend runs one call attempt as a job and answers three questions:
//! start it, how is it doing, stop it. The engine never blocks on a job;
//! call actors poll.
//!
//! - [`BackendAdapter`]: the submit/poll/kill contract
//! - [`BackendRegistry`]: named adapters, resolved per call
//! - [`ProcessBackend`]: bash on the local machine, optionally inside docker

pub mod process;
#[cfg(test)]
pub(crate) mod scripted;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::workflow::{CallKey, RuntimeAttributes, WorkflowGraph, WorkflowId, WorkflowOptions};

pub use process::{ProcessBackend, ProcessKind};

/// Errors reported by backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("job rejected: {0}")]
    Rejected(String),

    #[error("no backend named '{0}' is configured")]
    UnknownBackend(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a backend needs to run one call attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub key: CallKey,
    /// Command with every placeholder substituted
    pub command: String,
    pub inputs: BTreeMap<String, Value>,
    pub runtime: RuntimeAttributes,
}

/// Opaque reference to a submitted job. Persisted so a restarted engine can
/// keep polling it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_id: String,
    /// Execution directory; relative output paths resolve against it
    pub call_root: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Result of polling a job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    Running,
    /// The job ran to completion; `rc` may still be non-zero
    Done {
        rc: i32,
        stdout: PathBuf,
        stderr: PathBuf,
    },
    /// The job died without reporting a return code
    Failed { rc: i32 },
}

/// Execution backend contract.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, BackendError>;

    async fn poll(&self, handle: &JobHandle) -> Result<PollResult, BackendError>;

    /// Best-effort termination.
    async fn kill(&self, handle: &JobHandle) -> Result<(), BackendError>;
}

/// Named backends available to the engine.
pub struct BackendRegistry {
    default_backend: String,
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl BackendRegistry {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            default_backend: default_backend.into(),
            backends: HashMap::new(),
        }
    }

    /// Builds one [`ProcessBackend`] per configured backend.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new(config.default_backend.clone());
        for backend in &config.backends {
            let jobs = backend.concurrent_jobs.unwrap_or_else(num_cpus::get);
            info!(
                "Configured backend '{}' ({:?}, {} concurrent jobs, root {})",
                backend.name,
                backend.kind,
                jobs,
                backend.root.display()
            );
            registry.register(Arc::new(ProcessBackend::new(
                backend.name.clone(),
                backend.kind,
                backend.root.clone(),
                jobs,
            )));
        }
        registry
    }

    /// Adds a backend under its own name, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn BackendAdapter>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn BackendAdapter>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Picks the backend for a call: its runtime attribute, then the
    /// workflow option, then the engine default.
    pub fn resolve(
        &self,
        runtime: &RuntimeAttributes,
        options: &WorkflowOptions,
    ) -> Result<Arc<dyn BackendAdapter>, BackendError> {
        let name = runtime
            .backend
            .as_deref()
            .or(options.backend.as_deref())
            .unwrap_or(&self.default_backend);
        self.get(name)
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }

    /// Fails if any call of the workflow would resolve to a missing backend.
    pub fn check(&self, workflow: &WorkflowGraph, options: &WorkflowOptions) -> Result<(), BackendError> {
        for node in workflow.calls.values() {
            self.resolve(&node.definition.runtime, options)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::workflow::parser::parse_workflow;

    #[test]
    fn test_registry_resolution_order() {
        let registry = BackendRegistry::new("local")
            .with_backend(Arc::new(ProcessBackend::local("/tmp/pw-local")))
            .with_backend(Arc::new(ProcessBackend::new(
                "docker",
                ProcessKind::Docker,
                "/tmp/pw-docker",
                1,
            )));

        let mut runtime = RuntimeAttributes::default();
        let mut options = WorkflowOptions::default();
        assert_eq!(registry.resolve(&runtime, &options).unwrap().name(), "local");

        options.backend = Some("docker".to_string());
        assert_eq!(registry.resolve(&runtime, &options).unwrap().name(), "docker");

        runtime.backend = Some("local".to_string());
        assert_eq!(registry.resolve(&runtime, &options).unwrap().name(), "local");

        runtime.backend = Some("gpu".to_string());
        assert!(matches!(
            registry.resolve(&runtime, &options),
            Err(BackendError::UnknownBackend(name)) if name == "gpu"
        ));
        assert_eq!(registry.names(), vec!["docker", "local"]);
    }

    #[test]
    fn test_registry_from_config() {
        let mut config = EngineConfig::default();
        config.backends.push(BackendConfig {
            name: "docker".to_string(),
            kind: ProcessKind::Docker,
            root: PathBuf::from("/tmp/pw"),
            concurrent_jobs: Some(2),
        });

        let registry = BackendRegistry::from_config(&config);
        assert_eq!(registry.default_backend(), "local");
        assert!(registry.get("local").is_some());
        assert!(registry.get("docker").is_some());
    }

    #[test]
    fn test_check_reports_unknown_backend() {
        let source = "name: wf\ncalls:\n  - id: a\n    command: echo\n    runtime:\n      backend: cluster\n";
        let workflow = parse_workflow(source, None).unwrap();
        let registry = BackendRegistry::new("local").with_backend(Arc::new(ProcessBackend::local("/tmp/pw")));

        assert!(registry.check(&workflow, &WorkflowOptions::default()).is_err());
    }
}
