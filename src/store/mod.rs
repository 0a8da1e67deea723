//! Durable Store
//!
//! Persistence contract for workflow records, per-attempt call status rows
//! and call-scoped key/value pairs (job handles, log paths).
//!
//! - [`MemoryStore`]: in-process maps, lost on exit
//! - [`FileStore`]: one JSON document per workflow, survives restarts

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::status::{CallExecutionStatus, WorkflowOutputs};
use crate::workflow::{CallKey, Fqn, WorkflowDescriptor, WorkflowId, WorkflowSources, WorkflowState};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted summary of a workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    pub state: WorkflowState,
    pub sources: WorkflowSources,

    #[serde(default)]
    pub failures: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<WorkflowOutputs>,

    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// A fresh `Submitted` record for a parsed workflow.
    pub fn submitted(descriptor: &WorkflowDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: descriptor.id,
            name: descriptor.workflow.name.clone(),
            state: WorkflowState::Submitted,
            sources: descriptor.sources.clone(),
            failures: Vec::new(),
            outputs: None,
            submitted_at: now,
            updated_at: now,
        }
    }
}

/// Status row of one call attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallStatusRecord {
    pub key: CallKey,
    pub status: CallExecutionStatus,
    pub updated_at: DateTime<Utc>,
}

/// Scope of call-level key/value pairs: one attempt of one call instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeKey {
    pub workflow_id: WorkflowId,
    pub fqn: Fqn,
    pub index: Option<usize>,
    pub attempt: u32,
}

impl ScopeKey {
    pub fn call(workflow_id: WorkflowId, key: &CallKey) -> Self {
        Self {
            workflow_id,
            fqn: key.fqn.clone(),
            index: key.index,
            attempt: key.attempt,
        }
    }
}

/// One stored key/value pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyValueRecord {
    pub scope: ScopeKey,
    pub key: String,
    pub value: String,
}

/// Durable store collaborator.
///
/// Upserts on an existing key overwrite it. A write rejected with
/// [`StoreError::ConstraintViolation`] leaves every committed row intact.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError>;

    async fn workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError>;

    async fn workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    async fn upsert_call_status(
        &self,
        workflow_id: WorkflowId,
        key: &CallKey,
        status: &CallExecutionStatus,
    ) -> Result<(), StoreError>;

    /// Every attempt row of a workflow, ordered by call key.
    async fn call_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<CallStatusRecord>, StoreError>;

    async fn upsert_key_value(&self, scope: &ScopeKey, key: &str, value: &str) -> Result<(), StoreError>;

    async fn query_value(&self, scope: &ScopeKey, key: &str) -> Result<Option<String>, StoreError>;
}

/// Rows shared by both store implementations.
#[derive(Debug, Default, Clone)]
pub(crate) struct StoreState {
    pub(crate) workflows: BTreeMap<WorkflowId, WorkflowRecord>,
    pub(crate) calls: BTreeMap<(WorkflowId, CallKey), CallStatusRecord>,
    pub(crate) values: BTreeMap<(ScopeKey, String), String>,
}

impl StoreState {
    pub(crate) fn upsert_workflow(&mut self, record: WorkflowRecord) -> Result<(), StoreError> {
        if let Some(existing) = self.workflows.get(&record.id) {
            if existing.state.is_terminal() && existing.state != record.state {
                return Err(StoreError::ConstraintViolation(format!(
                    "workflow {} is already {}",
                    existing.id, existing.state
                )));
            }
        }
        self.workflows.insert(record.id, record);
        Ok(())
    }

    pub(crate) fn upsert_call_status(
        &mut self,
        workflow_id: WorkflowId,
        key: &CallKey,
        status: &CallExecutionStatus,
    ) -> Result<(), StoreError> {
        self.require_workflow(workflow_id)?;
        self.calls.insert(
            (workflow_id, key.clone()),
            CallStatusRecord {
                key: key.clone(),
                status: status.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub(crate) fn call_statuses(&self, workflow_id: WorkflowId) -> Vec<CallStatusRecord> {
        self.calls
            .iter()
            .filter(|((id, _), _)| *id == workflow_id)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub(crate) fn upsert_key_value(&mut self, scope: &ScopeKey, key: &str, value: &str) -> Result<(), StoreError> {
        if key.trim().is_empty() {
            return Err(StoreError::ConstraintViolation(format!(
                "empty key for call {} of workflow {}",
                scope.fqn, scope.workflow_id
            )));
        }
        self.require_workflow(scope.workflow_id)?;
        self.values
            .insert((scope.clone(), key.to_string()), value.to_string());
        Ok(())
    }

    pub(crate) fn query_value(&self, scope: &ScopeKey, key: &str) -> Option<String> {
        self.values.get(&(scope.clone(), key.to_string())).cloned()
    }

    /// Every key/value pair of a workflow.
    pub(crate) fn values_for(&self, workflow_id: WorkflowId) -> Vec<KeyValueRecord> {
        self.values
            .iter()
            .filter(|((scope, _), _)| scope.workflow_id == workflow_id)
            .map(|((scope, key), value)| KeyValueRecord {
                scope: scope.clone(),
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    fn require_workflow(&self, workflow_id: WorkflowId) -> Result<(), StoreError> {
        if self.workflows.contains_key(&workflow_id) {
            Ok(())
        } else {
            Err(StoreError::ConstraintViolation(format!(
                "workflow {} is not registered",
                workflow_id
            )))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(state: WorkflowState) -> WorkflowRecord {
        let now = Utc::now();
        WorkflowRecord {
            id: WorkflowId::new(),
            name: "wf".to_string(),
            state,
            sources: WorkflowSources::new("name: wf"),
            failures: Vec::new(),
            outputs: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn key(call: &str, attempt: u32) -> CallKey {
        CallKey::new(Fqn::call("wf", call), None, attempt)
    }

    /// Contract checks every store implementation must pass.
    pub(crate) async fn exercise_store(store: &dyn Store) {
        let workflow = record(WorkflowState::Submitted);
        let id = workflow.id;

        // Writes for an unknown workflow are rejected
        let result = store
            .upsert_call_status(id, &key("a", 1), &CallExecutionStatus::Starting)
            .await;
        assert!(matches!(result, Err(StoreError::ConstraintViolation(_))));

        store.upsert_workflow(workflow.clone()).await.unwrap();
        assert_eq!(store.workflow(id).await.unwrap(), Some(workflow.clone()));

        store
            .upsert_call_status(id, &key("a", 1), &CallExecutionStatus::Running)
            .await
            .unwrap();
        store
            .upsert_call_status(id, &key("a", 2), &CallExecutionStatus::Starting)
            .await
            .unwrap();
        // Overwrite
        store
            .upsert_call_status(id, &key("a", 2), &CallExecutionStatus::Aborted)
            .await
            .unwrap();

        let rows = store.call_statuses(id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, key("a", 1));
        assert_eq!(rows[1].status, CallExecutionStatus::Aborted);

        let scope = ScopeKey::call(id, &key("a", 1));
        store.upsert_key_value(&scope, "job", "123").await.unwrap();
        store.upsert_key_value(&scope, "job", "456").await.unwrap();
        assert_eq!(store.query_value(&scope, "job").await.unwrap().as_deref(), Some("456"));
        assert_eq!(store.query_value(&scope, "stdout").await.unwrap(), None);

        // Empty keys are rejected without touching committed values
        let result = store.upsert_key_value(&scope, " ", "x").await;
        assert!(matches!(result, Err(StoreError::ConstraintViolation(_))));
        assert_eq!(store.query_value(&scope, "job").await.unwrap().as_deref(), Some("456"));

        // Terminal workflows never revert
        let mut done = workflow.clone();
        done.state = WorkflowState::Succeeded;
        store.upsert_workflow(done.clone()).await.unwrap();
        let mut revert = done.clone();
        revert.state = WorkflowState::Running;
        assert!(store.upsert_workflow(revert).await.is_err());
        assert_eq!(store.workflow(id).await.unwrap().map(|r| r.state), Some(WorkflowState::Succeeded));

        assert_eq!(store.workflows().await.unwrap().len(), 1);
    }
}
