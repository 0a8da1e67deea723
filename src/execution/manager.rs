//! Workflow Manager
//!
//! Entry point of the engine. The manager parses submissions, spawns one
//! supervisor per run and answers queries from the snapshots the
//! supervisors publish. It is an ordinary value: create as many as needed,
//! and call [`WorkflowManager::shutdown`] when done.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::status::{CallExecutionStatus, WorkflowFailure, WorkflowOutputs};
use super::supervisor::{CallLogs, RestoredCalls, SupervisorContext, WorkflowSnapshot, WorkflowSupervisor};
use crate::backend::{BackendRegistry, JobHandle};
use crate::config::EngineConfig;
use crate::store::{CallStatusRecord, ScopeKey, Store, StoreError, WorkflowRecord};
use crate::workflow::{
    CallKey, InstanceKey, WorkflowDescriptor, WorkflowId, WorkflowOptions, WorkflowParser, WorkflowSources, WorkflowState,
    YamlWorkflowParser,
};

/// Errors returned by the manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("malformed workflow: {0}")]
    MalformedWorkflow(String),

    #[error("workflow {0} not found")]
    NotFound(WorkflowId),

    #[error("workflow {id} has no outputs while {state}")]
    OutputsNotFound { id: WorkflowId, state: WorkflowState },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Registry entry for one run.
struct WorkflowEntry {
    snapshot: watch::Receiver<WorkflowSnapshot>,
    cancel: CancellationToken,
}

/// Accepts workflows and tracks their runs.
pub struct WorkflowManager {
    parser: Arc<dyn WorkflowParser>,
    backends: Arc<BackendRegistry>,
    store: Arc<dyn Store>,
    config: EngineConfig,
    /// Parent of every workflow token
    shutdown: CancellationToken,
    workflows: RwLock<HashMap<WorkflowId, WorkflowEntry>>,
}

impl WorkflowManager {
    pub fn new(config: EngineConfig, backends: BackendRegistry, store: Arc<dyn Store>) -> Self {
        info!(
            "Workflow manager ready with backends [{}], default '{}'",
            backends.names().join(", "),
            backends.default_backend()
        );
        Self {
            parser: Arc::new(YamlWorkflowParser),
            backends: Arc::new(backends),
            store,
            config,
            shutdown: CancellationToken::new(),
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the YAML parser.
    pub fn with_parser(mut self, parser: Arc<dyn WorkflowParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn entries(&self) -> RwLockReadGuard<'_, HashMap<WorkflowId, WorkflowEntry>> {
        self.workflows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, HashMap<WorkflowId, WorkflowEntry>> {
        self.workflows.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn receiver(&self, id: WorkflowId) -> Result<watch::Receiver<WorkflowSnapshot>, ManagerError> {
        self.entries()
            .get(&id)
            .map(|entry| entry.snapshot.clone())
            .ok_or(ManagerError::NotFound(id))
    }

    /// Parses and validates a submission without running it.
    pub fn describe(&self, id: WorkflowId, sources: WorkflowSources) -> Result<WorkflowDescriptor, ManagerError> {
        let workflow = self
            .parser
            .parse(&sources.workflow_source, sources.inputs_json.as_deref())
            .map_err(|e| ManagerError::MalformedWorkflow(e.to_string()))?;
        let options = WorkflowOptions::parse(sources.options_json.as_deref())
            .map_err(|e| ManagerError::MalformedWorkflow(format!("invalid workflow options: {}", e)))?;
        self.backends
            .check(&workflow, &options)
            .map_err(|e| ManagerError::MalformedWorkflow(e.to_string()))?;

        Ok(WorkflowDescriptor {
            id,
            sources,
            workflow,
            options,
        })
    }

    /// Validates and starts a workflow. Returns as soon as it is running.
    pub async fn submit(&self, sources: WorkflowSources) -> Result<WorkflowId, ManagerError> {
        let descriptor = self.describe(WorkflowId::new(), sources)?;
        let id = descriptor.id;

        let record = WorkflowRecord::submitted(&descriptor);
        let mut snapshot = WorkflowSnapshot::submitted(&descriptor);
        snapshot.submitted_at = record.submitted_at;
        self.store.upsert_workflow(record).await?;

        info!(
            "Submitted workflow '{}' as {} ({} calls)",
            descriptor.workflow.name,
            id,
            descriptor.workflow.len()
        );
        self.launch(Arc::new(descriptor), snapshot, RestoredCalls::default());
        Ok(id)
    }

    /// Registers a run and spawns its supervisor with a crash monitor.
    fn launch(&self, descriptor: Arc<WorkflowDescriptor>, snapshot: WorkflowSnapshot, restored: RestoredCalls) {
        let id = descriptor.id;
        let aborting = snapshot.state == WorkflowState::Aborting;
        let (tx, rx) = watch::channel(snapshot);
        let tx = Arc::new(tx);

        let cancel = self.shutdown.child_token();
        if aborting {
            cancel.cancel();
        }
        self.entries_mut().insert(
            id,
            WorkflowEntry {
                snapshot: rx,
                cancel: cancel.clone(),
            },
        );

        let context = SupervisorContext {
            backends: self.backends.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
            snapshot: tx.clone(),
        };
        let supervisor = WorkflowSupervisor::new(descriptor.clone(), context, restored);
        let task = tokio::spawn(supervisor.run());

        let store = self.store.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(state) => debug!("Supervisor of workflow {} exited, {}", id, state),
                Err(e) => {
                    error!("Supervisor of workflow {} crashed: {}", id, e);
                    cancel.cancel();
                    mark_crashed(&descriptor, &tx, store.as_ref(), e.to_string()).await;
                }
            }
        });
    }

    /// Latest state, `None` for unknown workflows.
    pub fn status(&self, id: WorkflowId) -> Option<WorkflowState> {
        self.entries()
            .get(&id)
            .map(|entry| entry.snapshot.borrow().state)
    }

    pub fn snapshot(&self, id: WorkflowId) -> Option<WorkflowSnapshot> {
        self.entries()
            .get(&id)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    fn require_snapshot(&self, id: WorkflowId) -> Result<WorkflowSnapshot, ManagerError> {
        self.snapshot(id).ok_or(ManagerError::NotFound(id))
    }

    /// Outputs of a Succeeded workflow.
    pub fn outputs(&self, id: WorkflowId) -> Result<WorkflowOutputs, ManagerError> {
        let snapshot = self.require_snapshot(id)?;
        match (snapshot.state, snapshot.outputs) {
            (WorkflowState::Succeeded, Some(outputs)) => Ok(outputs),
            (state, _) => Err(ManagerError::OutputsNotFound { id, state }),
        }
    }

    pub fn failures(&self, id: WorkflowId) -> Result<Vec<WorkflowFailure>, ManagerError> {
        Ok(self.require_snapshot(id)?.failures)
    }

    /// Every stored attempt row of a workflow, including retried attempts.
    pub async fn call_statuses(&self, id: WorkflowId) -> Result<Vec<CallStatusRecord>, ManagerError> {
        let known = self.entries().contains_key(&id);
        if !known && self.store.workflow(id).await?.is_none() {
            return Err(ManagerError::NotFound(id));
        }
        Ok(self.store.call_statuses(id).await?)
    }

    /// Stdout/stderr locations of every submitted attempt.
    pub fn call_logs(&self, id: WorkflowId) -> Result<Vec<CallLogs>, ManagerError> {
        Ok(self.require_snapshot(id)?.logs.into_values().collect())
    }

    /// Gantt chart of the run so far.
    pub fn timeline(&self, id: WorkflowId) -> Result<String, ManagerError> {
        Ok(self.require_snapshot(id)?.timeline.gantt_chart())
    }

    /// Requests an abort. Does nothing for finished workflows.
    pub fn abort(&self, id: WorkflowId) -> Result<(), ManagerError> {
        let entries = self.entries();
        let entry = entries.get(&id).ok_or(ManagerError::NotFound(id))?;

        let state = entry.snapshot.borrow().state;
        if state.is_terminal() {
            info!("Workflow {} is already {}, nothing to abort", id, state);
            return Ok(());
        }

        info!("Abort requested for workflow {} ({})", id, state);
        entry.cancel.cancel();
        Ok(())
    }

    /// Resolves once the workflow is Succeeded, Failed or Aborted.
    pub async fn wait(&self, id: WorkflowId) -> Result<WorkflowSnapshot, ManagerError> {
        let mut rx = self.receiver(id)?;
        if let Ok(snapshot) = rx.wait_for(WorkflowSnapshot::is_terminal).await {
            return Ok(snapshot.clone());
        }
        // Every sender is gone; the last published value is final
        let snapshot = rx.borrow().clone();
        Ok(snapshot)
    }

    /// Snapshots of every registered workflow, oldest first.
    pub fn list(&self) -> Vec<WorkflowSnapshot> {
        let mut snapshots: Vec<WorkflowSnapshot> = self
            .entries()
            .values()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.submitted_at);
        snapshots
    }

    /// Drops a finished workflow from the registry. Its store rows stay.
    pub fn evict(&self, id: WorkflowId) -> Result<bool, ManagerError> {
        let mut entries = self.entries_mut();
        let terminal = entries
            .get(&id)
            .map(|entry| entry.snapshot.borrow().is_terminal())
            .ok_or(ManagerError::NotFound(id))?;

        if !terminal {
            warn!("Not evicting workflow {}: still running", id);
            return Ok(false);
        }
        entries.remove(&id);
        info!("Evicted workflow {}", id);
        Ok(true)
    }

    /// Evicts finished workflows older than the retention window.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.config.retention() else {
            return 0;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };

        let mut entries = self.entries_mut();
        let before = entries.len();
        entries.retain(|id, entry| {
            let snapshot = entry.snapshot.borrow();
            let expired = snapshot.is_terminal() && snapshot.updated_at + retention <= now;
            if expired {
                debug!("Workflow {} expired", id);
            }
            !expired
        });

        let evicted = before - entries.len();
        if evicted > 0 {
            info!("Evicted {} expired workflows", evicted);
        }
        evicted
    }

    /// Picks up every unfinished workflow left in the store.
    ///
    /// Done call instances are kept, jobs still known to their backend are
    /// polled again and interrupted attempts rerun as the next attempt.
    /// Failures that may not be retried stay failed, so the run fails.
    pub async fn restart(&self) -> Result<Vec<WorkflowId>, ManagerError> {
        let mut restarted = Vec::new();

        for record in self.store.workflows().await? {
            let known = self.entries().contains_key(&record.id);
            if record.state.is_terminal() || known {
                continue;
            }

            let descriptor = match self.describe(record.id, record.sources.clone()) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!("Cannot restart workflow {}: {}", record.id, e);
                    self.fail_record(record, e.to_string()).await?;
                    continue;
                }
            };

            let restored = self.restore_calls(&descriptor).await?;
            let mut snapshot = WorkflowSnapshot::submitted(&descriptor);
            snapshot.state = record.state;
            snapshot.submitted_at = record.submitted_at;

            info!(
                "Restarting workflow '{}' ({}) from {} with {} restored calls",
                descriptor.workflow.name,
                record.id,
                record.state,
                restored.len()
            );
            self.launch(Arc::new(descriptor), snapshot, restored);
            restarted.push(record.id);
        }

        Ok(restarted)
    }

    async fn fail_record(&self, mut record: WorkflowRecord, reason: String) -> Result<(), ManagerError> {
        record.state = WorkflowState::Failed;
        record.failures.push(reason);
        record.updated_at = Utc::now();
        self.store.upsert_workflow(record).await?;
        Ok(())
    }

    /// Sorts the latest attempt of every stored instance into done, resume,
    /// rerun, failed and aborted.
    ///
    /// A failed attempt only reruns when its cause is retryable and the
    /// call's retry budget is not spent. Aborted attempts of a run that
    /// already failed stay aborted; otherwise they rerun.
    async fn restore_calls(&self, descriptor: &WorkflowDescriptor) -> Result<RestoredCalls, ManagerError> {
        let id = descriptor.id;
        let mut latest: BTreeMap<InstanceKey, CallStatusRecord> = BTreeMap::new();
        for row in self.store.call_statuses(id).await? {
            let newer = latest
                .get(&row.key.instance())
                .map_or(true, |existing| existing.key.attempt < row.key.attempt);
            if newer {
                latest.insert(row.key.instance(), row);
            }
        }

        let mut restored = RestoredCalls::default();
        let mut aborted = Vec::new();
        for row in latest.into_values() {
            match row.status {
                CallExecutionStatus::Done(outputs) => restored.done.push((row.key, outputs)),
                CallExecutionStatus::Starting | CallExecutionStatus::Running => {
                    let scope = ScopeKey::call(id, &row.key);
                    let handle = self
                        .store
                        .query_value(&scope, "job")
                        .await?
                        .and_then(|json| serde_json::from_str::<JobHandle>(&json).ok());
                    match handle {
                        Some(handle) => restored.resume.push((row.key, handle)),
                        None => restored.rerun.push(row.key.next_attempt()),
                    }
                }
                CallExecutionStatus::NotStarted => restored.rerun.push(row.key),
                CallExecutionStatus::Failed(cause) => {
                    let budget = descriptor
                        .workflow
                        .call(&row.key.fqn)
                        .map_or(0, |node| descriptor.max_retries(node, self.config.max_retries));
                    if cause.is_retryable() && row.key.attempt <= budget {
                        restored.rerun.push(row.key.next_attempt());
                    } else {
                        debug!("Call {} stays failed: {}", row.key, cause);
                        restored.failed.push((row.key, cause));
                    }
                }
                CallExecutionStatus::Aborted => aborted.push(row.key),
            }
        }

        if restored.failed.is_empty() {
            restored.rerun.extend(aborted.iter().map(CallKey::next_attempt));
        } else {
            restored.aborted = aborted;
        }
        Ok(restored)
    }

    /// Aborts every live run and waits for all of them to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down workflow manager");
        self.shutdown.cancel();

        let receivers: Vec<watch::Receiver<WorkflowSnapshot>> = self
            .entries()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        for mut rx in receivers {
            let _ = rx.wait_for(WorkflowSnapshot::is_terminal).await;
        }
    }
}

/// Marks a run whose supervisor panicked as Failed.
async fn mark_crashed(
    descriptor: &WorkflowDescriptor,
    snapshot: &watch::Sender<WorkflowSnapshot>,
    store: &dyn Store,
    message: String,
) {
    let mut record = None;
    snapshot.send_modify(|s| {
        if s.state.is_terminal() {
            return;
        }
        s.state = WorkflowState::Failed;
        s.failures.push(WorkflowFailure::SupervisorCrashed(message));
        s.outputs = None;
        s.timeline.finish();
        s.updated_at = Utc::now();
        record = Some(WorkflowRecord {
            id: s.id,
            name: s.name.clone(),
            state: s.state,
            sources: descriptor.sources.clone(),
            failures: s.failures.iter().map(ToString::to_string).collect(),
            outputs: None,
            submitted_at: s.submitted_at,
            updated_at: s.updated_at,
        });
    });

    if let Some(record) = record {
        if let Err(e) = store.upsert_workflow(record).await {
            warn!("Could not persist crash of workflow {}: {}", descriptor.id, e);
        }
    }
}
