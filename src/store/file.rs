//! File-backed store.
//!
//! Each workflow is one JSON document, `{dir}/{workflow_id}.json`, holding
//! the workflow record, its call status rows and its key/value pairs. The
//! document is rewritten through a temporary file and a rename after every
//! change, so a crash never leaves a half-written file behind.
//!
//! Every workflow has its own lock. A change is applied to a copy of the
//! workflow's rows and only becomes visible once its document is on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{CallStatusRecord, KeyValueRecord, ScopeKey, Store, StoreError, StoreState, WorkflowRecord};
use crate::execution::status::CallExecutionStatus;
use crate::workflow::{CallKey, WorkflowId};

#[derive(Serialize, Deserialize)]
struct WorkflowDocument {
    record: WorkflowRecord,
    #[serde(default)]
    calls: Vec<CallStatusRecord>,
    #[serde(default)]
    values: Vec<KeyValueRecord>,
}

/// Rows of a single workflow.
type Slot = Arc<Mutex<StoreState>>;

/// Persists workflows as JSON files in a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    slots: RwLock<HashMap<WorkflowId, Slot>>,
}

impl FileStore {
    /// Opens (or creates) a store directory and loads every workflow in it.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut slots = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = fs::read_to_string(&path).await?;
            let document: WorkflowDocument = match serde_json::from_str(&content) {
                Ok(document) => document,
                Err(e) => {
                    warn!("Skipping unreadable store file {}: {}", path.display(), e);
                    continue;
                }
            };

            let id = document.record.id;
            let mut state = StoreState::default();
            for call in document.calls {
                state.calls.insert((id, call.key.clone()), call);
            }
            for value in document.values {
                state.values.insert((value.scope, value.key), value.value);
            }
            state.workflows.insert(id, document.record);
            slots.insert(id, Arc::new(Mutex::new(state)));
        }

        info!("Opened store at {} ({} workflows)", dir.display(), slots.len());

        Ok(Self {
            dir,
            slots: RwLock::new(slots),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, id: WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn slot(&self, id: WorkflowId) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn slot_or_default(&self, id: WorkflowId) -> Slot {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    fn all_slots(&self) -> Vec<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Applies `change` to a copy of a workflow's rows, writes the copy and
    /// only then makes it visible.
    async fn commit<F>(&self, id: WorkflowId, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<(), StoreError> + Send,
    {
        let Some(slot) = self.slot(id) else {
            return change(&mut StoreState::default());
        };
        self.commit_to(&slot, id, change).await
    }

    async fn commit_to<F>(&self, slot: &Slot, id: WorkflowId, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<(), StoreError> + Send,
    {
        let mut current = slot.lock().await;
        let mut next = current.clone();
        change(&mut next)?;
        self.persist(&next, id).await?;
        *current = next;
        Ok(())
    }

    async fn persist(&self, state: &StoreState, id: WorkflowId) -> Result<(), StoreError> {
        let Some(record) = state.workflows.get(&id) else {
            return Ok(());
        };

        let document = WorkflowDocument {
            record: record.clone(),
            calls: state.call_statuses(id),
            values: state.values_for(id),
        };
        let json = serde_json::to_string_pretty(&document)?;

        let path = self.file_for(id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Saved workflow {} to {}", id, path.display());
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn upsert_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        let id = record.id;
        let slot = self.slot_or_default(id);
        self.commit_to(&slot, id, |state| state.upsert_workflow(record))
            .await
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        let state = slot.lock().await;
        Ok(state.workflows.get(&id).cloned())
    }

    async fn workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut records = Vec::new();
        for slot in self.all_slots() {
            records.extend(slot.lock().await.workflows.values().cloned());
        }
        records.sort_by_key(|record| record.submitted_at);
        Ok(records)
    }

    async fn upsert_call_status(
        &self,
        workflow_id: WorkflowId,
        key: &CallKey,
        status: &CallExecutionStatus,
    ) -> Result<(), StoreError> {
        self.commit(workflow_id, |state| {
            state.upsert_call_status(workflow_id, key, status)
        })
        .await
    }

    async fn call_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<CallStatusRecord>, StoreError> {
        let Some(slot) = self.slot(workflow_id) else {
            return Ok(Vec::new());
        };
        let state = slot.lock().await;
        Ok(state.call_statuses(workflow_id))
    }

    async fn upsert_key_value(&self, scope: &ScopeKey, key: &str, value: &str) -> Result<(), StoreError> {
        self.commit(scope.workflow_id, |state| state.upsert_key_value(scope, key, value))
            .await
    }

    async fn query_value(&self, scope: &ScopeKey, key: &str) -> Result<Option<String>, StoreError> {
        let Some(slot) = self.slot(scope.workflow_id) else {
            return Ok(None);
        };
        let state = slot.lock().await;
        Ok(state.query_value(scope, key))
    }
}
