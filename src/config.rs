//! Engine Configuration
//!
//! Settings shared by every workflow a manager runs. Loaded from YAML;
//! every field has a default so an empty file is a valid configuration.
//!
//! ```yaml
//! poll_interval_ms: 1000
//! max_retries: 1
//! failure_mode: fail_slow
//! default_backend: local
//! backends:
//!   - name: local
//!     root: pipewright-executions
//!     concurrent_jobs: 4
//!   - name: docker
//!     kind: docker
//! store:
//!   kind: file
//!   path: .pipewright/store
//! retention_secs: 3600
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::ProcessKind;
use crate::workflow::FailureMode;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_root() -> PathBuf {
    PathBuf::from("pipewright-executions")
}

/// One configured process backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub name: String,

    #[serde(default)]
    pub kind: ProcessKind,

    /// Directory under which call execution directories are created
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Cap on concurrently running jobs; defaults to the number of CPUs
    #[serde(default)]
    pub concurrent_jobs: Option<usize>,
}

impl BackendConfig {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProcessKind::Local,
            root: default_root(),
            concurrent_jobs: None,
        }
    }
}

/// Where workflow and call state is persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

/// Engine-wide settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between two polls of a running job
    pub poll_interval_ms: u64,

    /// Consecutive poll errors tolerated before a call fails
    pub max_poll_failures: u32,

    /// Retry budget for calls that declare none
    pub max_retries: u32,

    pub failure_mode: FailureMode,

    pub default_backend: String,

    pub backends: Vec<BackendConfig>,

    pub store: StoreConfig,

    /// How long finished workflows stay queryable; `None` keeps them forever
    pub retention_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_poll_failures: 3,
            max_retries: 0,
            failure_mode: FailureMode::FailFast,
            default_backend: "local".to_string(),
            backends: vec![BackendConfig::local("local")],
            store: StoreConfig::Memory,
            retention_secs: None,
        }
    }
}

impl EngineConfig {
    /// Loads and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates a YAML configuration.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(ConfigError::Invalid("backend with an empty name".to_string()));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' is configured twice",
                    backend.name
                )));
            }
            if backend.concurrent_jobs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' must allow at least one concurrent job",
                    backend.name
                )));
            }
        }

        if !names.contains(self.default_backend.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "default backend '{}' is not configured",
                self.default_backend
            )));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}
