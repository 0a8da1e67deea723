//! Workflow Execution Supervisor
//!
//! One tokio task per workflow run. The supervisor dispatches a call actor
//! for every instance whose dependencies are done, expands scatters, applies
//! the failure policy and publishes a [`WorkflowSnapshot`] after every
//! change.
//!
//! Call actors report over an unbounded channel; the supervisor never
//! touches a call's status itself except for instances that could not be
//! started at all.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::call::{spawn_actor, CallActor, CallContext, CallEvent, CallSettings};
use super::status::{CallExecutionStatus, CallFailure, CallOutputs, WorkflowFailure, WorkflowOutputs};
use crate::backend::{BackendRegistry, JobHandle, JobRequest};
use crate::config::EngineConfig;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::store::{Store, WorkflowRecord};
use crate::workflow::{
    render_template, CallKey, CallNode, CallSnapshot, ExecutionPlanner, FailureMode, Fqn, InputExpr,
    InstanceKey, WorkflowDescriptor, WorkflowId, WorkflowState,
};

/// Log locations of one call attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CallLogs {
    pub key: CallKey,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Point-in-time view of a workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub id: WorkflowId,
    pub name: String,
    pub state: WorkflowState,
    pub calls: BTreeMap<InstanceKey, CallSnapshot>,
    pub logs: BTreeMap<CallKey, CallLogs>,
    /// Only set once the run Succeeded
    pub outputs: Option<WorkflowOutputs>,
    pub failures: Vec<WorkflowFailure>,
    pub timeline: ExecutionTimeline,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    pub fn submitted(descriptor: &WorkflowDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: descriptor.id,
            name: descriptor.workflow.name.clone(),
            state: WorkflowState::Submitted,
            calls: BTreeMap::new(),
            logs: BTreeMap::new(),
            outputs: None,
            failures: Vec::new(),
            timeline: ExecutionTimeline::new(),
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Instances per call status name.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for snapshot in self.calls.values() {
            *counts.entry(snapshot.status.name()).or_insert(0) += 1;
        }
        counts
    }
}

/// Call state recovered from the store for a restarted run.
#[derive(Debug, Clone, Default)]
pub struct RestoredCalls {
    /// Finished attempts; never rerun
    pub done: Vec<(CallKey, CallOutputs)>,
    /// Attempts whose job is still known to the backend
    pub resume: Vec<(CallKey, JobHandle)>,
    /// Attempts to start from scratch
    pub rerun: Vec<CallKey>,
    /// Failures that may not be retried; the run cannot succeed
    pub failed: Vec<(CallKey, CallFailure)>,
    /// Attempts cancelled because another call failed
    pub aborted: Vec<CallKey>,
}

impl RestoredCalls {
    pub fn len(&self) -> usize {
        self.done.len() + self.resume.len() + self.rerun.len() + self.failed.len() + self.aborted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collaborators handed to a supervisor by the manager.
pub struct SupervisorContext {
    pub backends: Arc<BackendRegistry>,
    pub store: Arc<dyn Store>,
    pub config: EngineConfig,
    /// Cancelled to abort the run
    pub cancel: CancellationToken,
    pub snapshot: Arc<watch::Sender<WorkflowSnapshot>>,
}

/// Drives one workflow run to a terminal state.
pub struct WorkflowSupervisor {
    descriptor: Arc<WorkflowDescriptor>,
    context: SupervisorContext,
    planner: ExecutionPlanner,
    state: WorkflowState,
    failure_mode: FailureMode,
    settings: CallSettings,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    /// Instances with a running actor
    live: BTreeMap<InstanceKey, CancellationToken>,
    recover: BTreeMap<InstanceKey, JobHandle>,
    scatters: BTreeMap<Fqn, Vec<Value>>,
    logs: BTreeMap<CallKey, CallLogs>,
    failures: Vec<WorkflowFailure>,
    outputs: Option<WorkflowOutputs>,
    timeline: ExecutionTimeline,
    aborting: bool,
    submitted_at: DateTime<Utc>,
}

impl WorkflowSupervisor {
    pub fn new(descriptor: Arc<WorkflowDescriptor>, context: SupervisorContext, restored: RestoredCalls) -> Self {
        let mut planner = ExecutionPlanner::new(&descriptor.workflow);
        let mut recover = BTreeMap::new();
        let mut failures = Vec::new();

        if !restored.is_empty() {
            info!(
                "Restoring workflow {}: {} done, {} resumed, {} rerun, {} failed",
                descriptor.id,
                restored.done.len(),
                restored.resume.len(),
                restored.rerun.len(),
                restored.failed.len()
            );
        }
        for (key, outputs) in restored.done {
            planner.restore(
                key.instance(),
                CallSnapshot {
                    attempt: key.attempt,
                    status: CallExecutionStatus::Done(outputs),
                    dispatched: true,
                },
            );
        }
        for (key, handle) in restored.resume {
            planner.restore(
                key.instance(),
                CallSnapshot {
                    attempt: key.attempt,
                    ..CallSnapshot::default()
                },
            );
            recover.insert(key.instance(), handle);
        }
        for key in restored.rerun {
            planner.restore(
                key.instance(),
                CallSnapshot {
                    attempt: key.attempt,
                    ..CallSnapshot::default()
                },
            );
        }
        for (key, cause) in restored.failed {
            planner.restore(
                key.instance(),
                CallSnapshot {
                    attempt: key.attempt,
                    status: CallExecutionStatus::Failed(cause.clone()),
                    dispatched: true,
                },
            );
            failures.push(WorkflowFailure::Call { key, cause });
        }
        for key in restored.aborted {
            planner.restore(
                key.instance(),
                CallSnapshot {
                    attempt: key.attempt,
                    status: CallExecutionStatus::Aborted,
                    dispatched: true,
                },
            );
        }

        let failure_mode = descriptor
            .options
            .failure_mode
            .unwrap_or(context.config.failure_mode);
        let settings = CallSettings::from(&context.config);
        let (state, submitted_at) = {
            let snapshot = context.snapshot.borrow();
            (snapshot.state, snapshot.submitted_at)
        };
        let (events_tx, events) = mpsc::unbounded_channel();

        Self {
            descriptor,
            context,
            planner,
            state,
            failure_mode,
            settings,
            events_tx,
            events,
            live: BTreeMap::new(),
            recover,
            scatters: BTreeMap::new(),
            logs: BTreeMap::new(),
            failures,
            outputs: None,
            timeline: ExecutionTimeline::new(),
            aborting: false,
            submitted_at,
        }
    }

    /// Runs the workflow until it is Succeeded, Failed or Aborted.
    pub async fn run(mut self) -> WorkflowState {
        info!(
            "Starting workflow '{}' ({}) in {:?} mode",
            self.descriptor.workflow.name, self.descriptor.id, self.failure_mode
        );
        if self.state == WorkflowState::Submitted {
            self.set_state(WorkflowState::Running).await;
        }

        loop {
            if !self.aborting && self.context.cancel.is_cancelled() {
                self.begin_abort().await;
            }
            if !self.may_dispatch() && !self.recover.is_empty() {
                self.kill_orphans().await;
            }
            if self.may_dispatch() {
                self.schedule().await;
            }
            if self.live.is_empty() {
                break;
            }

            let event = tokio::select! {
                _ = self.context.cancel.cancelled(), if !self.aborting => None,
                event = self.events.recv() => event,
            };
            if let Some(event) = event {
                self.handle(event).await;
            }
        }

        self.finish().await
    }

    fn may_dispatch(&self) -> bool {
        if self.aborting {
            return false;
        }
        self.failure_mode == FailureMode::FailSlow || self.failures.is_empty()
    }

    /// Expands ready scatters and dispatches every runnable instance.
    async fn schedule(&mut self) {
        loop {
            let pending = self.planner.pending_scatters();
            for fqn in &pending {
                self.expand(fqn).await;
            }

            for instance in self.planner.runnable() {
                if !self.may_dispatch() {
                    break;
                }
                self.dispatch(instance).await;
            }

            // An empty scatter finishes its call at once and may unlock more
            if pending.is_empty() || !self.may_dispatch() {
                break;
            }
        }
        self.publish();
    }

    async fn expand(&mut self, fqn: &Fqn) {
        let descriptor = self.descriptor.clone();
        let Some(scatter) = descriptor.workflow.call(fqn).and_then(|node| node.scatter.as_ref()) else {
            return;
        };

        match self.resolve(&scatter.collection, None) {
            Ok(Value::Array(items)) => {
                self.planner.expand_scatter(fqn, items.len());
                self.scatters.insert(fqn.clone(), items);
            }
            Ok(other) => {
                let cause = CallFailure::InputResolution(format!(
                    "scatter collection of {} is not an array: {}",
                    fqn, other
                ));
                self.reject(InstanceKey::new(fqn.clone(), None), cause).await;
            }
            Err(cause) => self.reject(InstanceKey::new(fqn.clone(), None), cause).await,
        }
    }

    async fn dispatch(&mut self, instance: InstanceKey) {
        let descriptor = self.descriptor.clone();
        let Some(node) = descriptor.workflow.call(&instance.fqn) else {
            return;
        };
        let attempt = self.planner.mark_dispatched(&instance);
        let key = instance.attempt(attempt);

        let request = match self.prepare_job(node, key.clone()) {
            Ok(request) => request,
            Err(cause) => return self.reject(instance, cause).await,
        };
        let backend = match self
            .context
            .backends
            .resolve(&node.definition.runtime, &descriptor.options)
        {
            Ok(backend) => backend,
            Err(e) => return self.reject(instance, CallFailure::Submission(e.to_string())).await,
        };

        let cancel = self.context.cancel.child_token();
        let context = CallContext {
            workflow_id: descriptor.id,
            backend,
            store: self.context.store.clone(),
            settings: self.settings,
            events: self.events_tx.clone(),
            cancel: cancel.clone(),
        };

        let mut actor = CallActor::new(request, node, self.max_retries(node), context);
        if let Some(handle) = self.recover.remove(&instance) {
            actor = actor.recover_from(handle);
        }

        debug!("Dispatching {}", key);
        spawn_actor(actor);
        self.live.insert(instance, cancel);
    }

    /// Resolves inputs and renders the command of one call attempt.
    fn prepare_job(&self, node: &CallNode, key: CallKey) -> Result<JobRequest, CallFailure> {
        let item = match key.index {
            Some(index) => Some(
                self.scatters
                    .get(&key.fqn)
                    .and_then(|items| items.get(index))
                    .cloned()
                    .ok_or_else(|| {
                        CallFailure::InputResolution(format!("no scatter element {} for {}", index, key.fqn))
                    })?,
            ),
            None => None,
        };

        let mut inputs = BTreeMap::new();
        for (name, expr) in &node.inputs {
            inputs.insert(name.clone(), self.resolve(expr, item.as_ref())?);
        }
        if let (Some(scatter), Some(item)) = (&node.scatter, item) {
            inputs.insert(scatter.variable.clone(), item);
        }

        Ok(JobRequest {
            workflow_id: self.descriptor.id,
            workflow_name: self.descriptor.workflow.name.clone(),
            command: render_template(&node.definition.command, &inputs),
            key,
            inputs,
            runtime: node.definition.runtime.clone(),
        })
    }

    fn resolve(&self, expr: &InputExpr, item: Option<&Value>) -> Result<Value, CallFailure> {
        match expr {
            InputExpr::Literal(value) => Ok(value.clone()),
            InputExpr::WorkflowInput(name) => self
                .descriptor
                .workflow
                .inputs
                .get(name)
                .cloned()
                .ok_or_else(|| CallFailure::InputResolution(format!("workflow input '{}' has no value", name))),
            InputExpr::ScatterItem(variable) => item
                .cloned()
                .ok_or_else(|| CallFailure::InputResolution(format!("'{}' is only bound inside its scatter", variable))),
            InputExpr::CallOutput { call, output } => self
                .planner
                .lookup_output(call, output)
                .ok_or_else(|| CallFailure::InputResolution(format!("output '{}' of {} is not available", output, call))),
        }
    }

    fn max_retries(&self, node: &CallNode) -> u32 {
        self.descriptor.max_retries(node, self.context.config.max_retries)
    }

    /// Fails an instance that never got an actor.
    async fn reject(&mut self, instance: InstanceKey, cause: CallFailure) {
        error!("Call {} cannot start: {}", instance, cause);
        let key = self.planner.reject(&instance, cause.clone());
        self.persist_call(&key, &CallExecutionStatus::Failed(cause.clone()))
            .await;
        self.timeline.add_event(key.to_string(), EventType::Failed);
        self.record_failure(WorkflowFailure::Call { key, cause });
    }

    async fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Status { key, status } => self.on_status(key, status),
            CallEvent::JobStarted { key, job } => {
                self.logs.insert(
                    key.clone(),
                    CallLogs {
                        key,
                        stdout: job.stdout,
                        stderr: job.stderr,
                    },
                );
            }
            CallEvent::Retrying { key, cause } => {
                if self.planner.retrying(&key) {
                    info!("Call {} will be retried after {}", key, cause.kind());
                    self.timeline.add_event(key.to_string(), EventType::Retried);
                }
            }
            CallEvent::Crashed { instance, message } => {
                let attempt = self.planner.snapshot(&instance).map_or(1, |s| s.attempt);
                let key = instance.attempt(attempt);
                let status = CallExecutionStatus::Failed(CallFailure::Crashed(message));
                self.persist_call(&key, &status).await;
                self.on_status(key, status);
            }
        }
        self.publish();
    }

    fn on_status(&mut self, key: CallKey, status: CallExecutionStatus) {
        if !self.planner.update(&key, status.clone()) {
            debug!("Ignoring stale {} report for {}", status, key);
            return;
        }

        let event = match &status {
            CallExecutionStatus::Starting => Some(EventType::Started),
            CallExecutionStatus::Done(_) => Some(EventType::Completed),
            CallExecutionStatus::Failed(_) => Some(EventType::Failed),
            CallExecutionStatus::Aborted => Some(EventType::Aborted),
            CallExecutionStatus::NotStarted | CallExecutionStatus::Running => None,
        };
        if let Some(event) = event {
            self.timeline.add_event(key.to_string(), event);
        }
        if status.is_terminal() {
            self.live.remove(&key.instance());
        }

        match status {
            CallExecutionStatus::Done(_) => info!("Call {} done", key),
            CallExecutionStatus::Aborted => info!("Call {} aborted", key),
            CallExecutionStatus::Failed(cause) => {
                error!("Call {} failed: {}", key, cause);
                self.record_failure(WorkflowFailure::Call { key, cause });
            }
            CallExecutionStatus::NotStarted | CallExecutionStatus::Starting | CallExecutionStatus::Running => {}
        }
    }

    fn record_failure(&mut self, failure: WorkflowFailure) {
        let first = self.failures.is_empty();
        self.failures.push(failure);

        if first && self.failure_mode == FailureMode::FailFast && !self.aborting {
            warn!(
                "Workflow {} is failing, cancelling {} running calls",
                self.descriptor.id,
                self.live.len()
            );
            for token in self.live.values() {
                token.cancel();
            }
        }
    }

    async fn begin_abort(&mut self) {
        info!(
            "Aborting workflow {} with {} running calls",
            self.descriptor.id,
            self.live.len()
        );
        self.aborting = true;
        // Live actors hold child tokens of the cancelled workflow token
        self.set_state(WorkflowState::Aborting).await;
    }

    /// Kills recovered jobs that no actor will pick up once dispatch stopped.
    async fn kill_orphans(&mut self) {
        let descriptor = self.descriptor.clone();
        for (instance, handle) in std::mem::take(&mut self.recover) {
            let Some(node) = descriptor.workflow.call(&instance.fqn) else {
                continue;
            };
            match self
                .context
                .backends
                .resolve(&node.definition.runtime, &descriptor.options)
            {
                Ok(backend) => {
                    if let Err(e) = backend.kill(&handle).await {
                        warn!("Killing job {} of {} failed: {}", handle.job_id, instance, e);
                    }
                }
                Err(e) => warn!("Cannot kill job {} of {}: {}", handle.job_id, instance, e),
            }

            let attempt = self.planner.snapshot(&instance).map_or(1, |s| s.attempt);
            let key = instance.attempt(attempt);
            self.persist_call(&key, &CallExecutionStatus::Aborted).await;
            self.on_status(key, CallExecutionStatus::Aborted);
        }
    }

    async fn finish(mut self) -> WorkflowState {
        let state = if self.aborting {
            WorkflowState::Aborted
        } else if !self.failures.is_empty() {
            WorkflowState::Failed
        } else if !self.planner.all_done() {
            let calls = self
                .planner
                .unfinished()
                .iter()
                .map(ToString::to_string)
                .collect();
            self.failures.push(WorkflowFailure::Unreachable { calls });
            WorkflowState::Failed
        } else {
            match self.resolve_outputs() {
                Ok(outputs) => {
                    self.outputs = Some(outputs);
                    WorkflowState::Succeeded
                }
                Err(missing) => {
                    self.failures.extend(missing);
                    WorkflowState::Failed
                }
            }
        };

        self.timeline.finish();
        self.set_state(state).await;

        match state {
            WorkflowState::Succeeded => info!(
                "Workflow {} succeeded in {:.2?}",
                self.descriptor.id,
                self.timeline.elapsed()
            ),
            _ => warn!(
                "Workflow {} finished as {} with {} failures",
                self.descriptor.id,
                state,
                self.failures.len()
            ),
        }
        state
    }

    /// Looks up every declared workflow output.
    fn resolve_outputs(&self) -> Result<WorkflowOutputs, Vec<WorkflowFailure>> {
        let mut outputs = WorkflowOutputs::new();
        let mut missing = Vec::new();

        for reference in &self.descriptor.workflow.outputs {
            match self.planner.lookup_output(&reference.call, &reference.name) {
                Some(value) => {
                    outputs.insert(reference.fqn.clone(), value);
                }
                None => missing.push(WorkflowFailure::OutputLookup {
                    fqn: reference.fqn.clone(),
                }),
            }
        }

        if missing.is_empty() {
            Ok(outputs)
        } else {
            Err(missing)
        }
    }

    /// Persists the workflow record and publishes a snapshot.
    async fn set_state(&mut self, next: WorkflowState) {
        if next != self.state {
            if !self.state.can_transition_to(next) {
                warn!(
                    "Ignoring transition of workflow {} from {} to {}",
                    self.descriptor.id, self.state, next
                );
                return;
            }
            info!("Workflow {} is {}", self.descriptor.id, next);
            self.state = next;
        }

        let record = WorkflowRecord {
            id: self.descriptor.id,
            name: self.descriptor.workflow.name.clone(),
            state: self.state,
            sources: self.descriptor.sources.clone(),
            failures: self.failures.iter().map(ToString::to_string).collect(),
            outputs: self.outputs.clone(),
            submitted_at: self.submitted_at,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.context.store.upsert_workflow(record).await {
            warn!("Could not persist workflow {}: {}", self.descriptor.id, e);
        }
        self.publish();
    }

    async fn persist_call(&self, key: &CallKey, status: &CallExecutionStatus) {
        if let Err(e) = self
            .context
            .store
            .upsert_call_status(self.descriptor.id, key, status)
            .await
        {
            warn!("Could not persist status of {}: {}", key, e);
        }
    }

    fn publish(&self) {
        let calls = self.planner.instances();
        self.context.snapshot.send_modify(|snapshot| {
            snapshot.state = self.state;
            snapshot.calls = calls;
            snapshot.logs = self.logs.clone();
            snapshot.outputs = self.outputs.clone();
            snapshot.failures = self.failures.clone();
            snapshot.timeline = self.timeline.clone();
            snapshot.updated_at = Utc::now();
        });
    }
}
