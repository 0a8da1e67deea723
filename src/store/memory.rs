//! In-memory store.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CallStatusRecord, ScopeKey, Store, StoreError, StoreState, WorkflowRecord};
use crate::execution::status::CallExecutionStatus;
use crate::workflow::{CallKey, WorkflowId};

/// Keeps everything in process memory. Used for one-shot runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        self.state.lock().await.upsert_workflow(record)
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.state.lock().await.workflows.get(&id).cloned())
    }

    async fn workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        Ok(self.state.lock().await.workflows.values().cloned().collect())
    }

    async fn upsert_call_status(
        &self,
        workflow_id: WorkflowId,
        key: &CallKey,
        status: &CallExecutionStatus,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .upsert_call_status(workflow_id, key, status)
    }

    async fn call_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<CallStatusRecord>, StoreError> {
        Ok(self.state.lock().await.call_statuses(workflow_id))
    }

    async fn upsert_key_value(&self, scope: &ScopeKey, key: &str, value: &str) -> Result<(), StoreError> {
        self.state.lock().await.upsert_key_value(scope, key, value)
    }

    async fn query_value(&self, scope: &ScopeKey, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.query_value(scope, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::exercise_store;

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStore::new();
        exercise_store(&store).await;
    }
}
