//! Pipewright - Workflow Execution Engine
//!
//! Runs workflows of shell calls as a graph of tokio tasks: a manager that
//! accepts submissions, one supervisor per run and one actor per call
//! instance. Jobs go to pluggable backends through a submit/poll/kill
//! contract, and every status change is written to a durable store so an
//! interrupted engine can pick its runs up again.
//!
//! # Architecture
//!
//! - [`workflow`]: Definitions, parsing, validation and scheduling bookkeeping
//! - [`execution`]: Manager, supervisors and call actors
//! - [`backend`]: Backend contract, registry and the local process backend
//! - [`store`]: Durable workflow, call and key/value records
//! - [`config`]: Engine configuration
//! - [`monitoring`]: Execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pipewright::backend::BackendRegistry;
//! use pipewright::config::EngineConfig;
//! use pipewright::execution::WorkflowManager;
//! use pipewright::store::MemoryStore;
//! use pipewright::workflow::WorkflowSources;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let backends = BackendRegistry::from_config(&config);
//!     let manager = WorkflowManager::new(config, backends, Arc::new(MemoryStore::new()));
//!
//!     let source = std::fs::read_to_string("pipeline.yaml")?;
//!     let id = manager.submit(WorkflowSources::new(source)).await?;
//!
//!     let snapshot = manager.wait(id).await?;
//!     println!("{}: {:?}", snapshot.state, snapshot.outputs);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod execution;
pub mod monitoring;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use execution::{ManagerError, WorkflowManager};
pub use workflow::model::{CallDefinition, WorkflowDefinition};
pub use workflow::parser::load_sources;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Pipewright";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Pipewright");
    }

    #[test]
    fn test_module_exports_definitions() {
        let mut definition = WorkflowDefinition::new("wf");
        definition
            .add_call(CallDefinition::new("hello", "echo hi"))
            .unwrap();
        assert_eq!(definition.len(), 1);
        assert_eq!(definition.get_call("hello").unwrap().command, "echo hi");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
