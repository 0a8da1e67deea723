//! Execution Planner
//!
//! Scheduling bookkeeping for one workflow run:
//! - Dependency tracking between calls
//! - Scatter expansion into indexed instances
//! - Call instance status snapshots
//! - Output lookup, with scattered outputs gathered in index order
//!
//! The planner only records what it is told. Call statuses are owned by
//! the call actors; the supervisor feeds their reports in through
//! [`ExecutionPlanner::update`].

use std::collections::BTreeMap;

use log::{debug, info};
use serde_json::Value;

use super::graph::{DependencyGraph, WorkflowGraph};
use super::model::{CallKey, Fqn, InstanceKey};
use crate::execution::status::{CallExecutionStatus, CallFailure, CallOutputs};

/// Latest known state of one call instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    /// Attempt the status belongs to
    pub attempt: u32,
    pub status: CallExecutionStatus,
    /// Whether an actor was spawned (or the instance rejected)
    pub dispatched: bool,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            attempt: 1,
            status: CallExecutionStatus::NotStarted,
            dispatched: false,
        }
    }
}

#[derive(Debug, Clone)]
struct CallInstances {
    scattered: bool,
    /// Scattered calls get their shards once the collection is known
    expanded: bool,
    outputs: Vec<String>,
    shards: BTreeMap<Option<usize>, CallSnapshot>,
}

/// Tracks call instances and decides which ones may run.
pub struct ExecutionPlanner {
    graph: DependencyGraph,
    calls: BTreeMap<Fqn, CallInstances>,
    /// Restored snapshots for shards that do not exist yet
    restored: BTreeMap<InstanceKey, CallSnapshot>,
}

impl ExecutionPlanner {
    /// Creates a planner with every call NotStarted.
    pub fn new(workflow: &WorkflowGraph) -> Self {
        let calls = workflow
            .calls
            .values()
            .map(|node| {
                let scattered = node.is_scattered();
                let mut shards = BTreeMap::new();
                if !scattered {
                    shards.insert(None, CallSnapshot::default());
                }
                let instances = CallInstances {
                    scattered,
                    expanded: !scattered,
                    outputs: node.outputs.keys().cloned().collect(),
                    shards,
                };
                (node.fqn.clone(), instances)
            })
            .collect();

        info!("Execution planner created for {} calls", workflow.calls.len());

        Self {
            graph: workflow.graph.clone(),
            calls,
            restored: BTreeMap::new(),
        }
    }

    /// Seeds an instance with state recovered from a previous run.
    pub fn restore(&mut self, instance: InstanceKey, snapshot: CallSnapshot) {
        match self.calls.get_mut(&instance.fqn) {
            Some(call) if !call.scattered && instance.index.is_none() => {
                debug!("Restored {} as {}", instance, snapshot.status);
                call.shards.insert(None, snapshot);
            }
            Some(call) if call.scattered && instance.index.is_some() => {
                self.restored.insert(instance, snapshot);
            }
            // A scatter rejected as a whole
            Some(call) if call.scattered && snapshot.status.is_terminal() => {
                debug!("Restored {} as {}", instance, snapshot.status);
                call.expanded = true;
                call.shards.insert(None, snapshot);
            }
            _ => debug!("Ignoring restored state for unknown instance {}", instance),
        }
    }

    fn upstream_done(&self, fqn: &Fqn) -> bool {
        self.graph.upstream(fqn).all(|up| self.is_call_done(up))
    }

    /// Scattered calls whose dependencies are done but whose width is unknown.
    pub fn pending_scatters(&self) -> Vec<Fqn> {
        self.graph
            .topological_order()
            .iter()
            .filter(|fqn| {
                self.calls
                    .get(*fqn)
                    .map_or(false, |call| call.scattered && !call.expanded)
                    && self.upstream_done(fqn)
            })
            .cloned()
            .collect()
    }

    /// Creates `width` indexed instances of a scattered call.
    ///
    /// A width of zero leaves the call done with no instances.
    pub fn expand_scatter(&mut self, fqn: &Fqn, width: usize) {
        let Some(call) = self.calls.get_mut(fqn) else {
            return;
        };
        if call.expanded {
            return;
        }

        for index in 0..width {
            let instance = InstanceKey::new(fqn.clone(), Some(index));
            let snapshot = self.restored.remove(&instance).unwrap_or_default();
            call.shards.insert(Some(index), snapshot);
        }
        call.expanded = true;

        info!("Scatter {} expanded into {} instances", fqn, width);
    }

    /// Instances whose dependencies are done and that have not been dispatched.
    pub fn runnable(&self) -> Vec<InstanceKey> {
        let mut ready = Vec::new();

        for fqn in self.graph.topological_order() {
            let Some(call) = self.calls.get(fqn) else {
                continue;
            };
            if !call.expanded || !self.upstream_done(fqn) {
                continue;
            }
            for (index, snapshot) in &call.shards {
                if !snapshot.dispatched && snapshot.status == CallExecutionStatus::NotStarted {
                    ready.push(InstanceKey::new(fqn.clone(), *index));
                }
            }
        }

        if !ready.is_empty() {
            debug!("Runnable instances: {:?}", ready);
        }
        ready
    }

    fn shard_mut(&mut self, instance: &InstanceKey) -> Option<&mut CallSnapshot> {
        self.calls
            .get_mut(&instance.fqn)?
            .shards
            .get_mut(&instance.index)
    }

    /// Marks an instance as handed to an actor and returns its attempt.
    pub fn mark_dispatched(&mut self, instance: &InstanceKey) -> u32 {
        match self.shard_mut(instance) {
            Some(snapshot) => {
                snapshot.dispatched = true;
                snapshot.attempt
            }
            None => 1,
        }
    }

    /// Fails an instance that never got an actor.
    ///
    /// A scattered call whose collection could not be resolved is rejected
    /// as a whole through its `None` index.
    pub fn reject(&mut self, instance: &InstanceKey, cause: CallFailure) -> CallKey {
        let Some(call) = self.calls.get_mut(&instance.fqn) else {
            return instance.attempt(1);
        };
        call.expanded = true;
        let snapshot = call.shards.entry(instance.index).or_default();
        snapshot.dispatched = true;
        snapshot.status = CallExecutionStatus::Failed(cause);
        instance.attempt(snapshot.attempt)
    }

    /// Applies a status reported for a call attempt.
    ///
    /// Reports for older attempts, reports that would move an instance
    /// backwards and reports after a terminal status are ignored. Returns
    /// whether the snapshot changed.
    pub fn update(&mut self, key: &CallKey, status: CallExecutionStatus) -> bool {
        let Some(snapshot) = self.shard_mut(&key.instance()) else {
            return false;
        };

        if key.attempt < snapshot.attempt {
            return false;
        }
        if key.attempt == snapshot.attempt
            && (snapshot.status.is_terminal() || status.rank() < snapshot.status.rank())
        {
            return false;
        }

        snapshot.attempt = key.attempt;
        snapshot.status = status;
        true
    }

    /// Moves an instance on to its next attempt after a retryable failure.
    pub fn retrying(&mut self, key: &CallKey) -> bool {
        match self.shard_mut(&key.instance()) {
            Some(snapshot) if snapshot.attempt <= key.attempt => {
                snapshot.attempt = key.attempt + 1;
                snapshot.status = CallExecutionStatus::NotStarted;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self, instance: &InstanceKey) -> Option<&CallSnapshot> {
        self.calls.get(&instance.fqn)?.shards.get(&instance.index)
    }

    /// Whether every instance of a call is Done.
    pub fn is_call_done(&self, fqn: &Fqn) -> bool {
        self.calls.get(fqn).map_or(false, |call| {
            call.expanded && call.shards.values().all(|s| s.status.is_done())
        })
    }

    /// Whether every call in the workflow is Done.
    pub fn all_done(&self) -> bool {
        self.calls.keys().all(|fqn| self.is_call_done(fqn))
    }

    /// Calls that are not Done, in dependency order.
    pub fn unfinished(&self) -> Vec<Fqn> {
        self.graph
            .topological_order()
            .iter()
            .filter(|fqn| !self.is_call_done(fqn))
            .cloned()
            .collect()
    }

    /// Outputs of a finished call. Scattered calls gather each output into
    /// an array ordered by index.
    pub fn call_outputs(&self, fqn: &Fqn) -> Option<CallOutputs> {
        if !self.is_call_done(fqn) {
            return None;
        }
        let call = self.calls.get(fqn)?;

        if !call.scattered {
            return match &call.shards.get(&None)?.status {
                CallExecutionStatus::Done(outputs) => Some(outputs.clone()),
                _ => None,
            };
        }

        let mut gathered = CallOutputs::new();
        for name in &call.outputs {
            let values: Option<Vec<Value>> = call
                .shards
                .values()
                .map(|shard| match &shard.status {
                    CallExecutionStatus::Done(outputs) => outputs.get(name).cloned(),
                    _ => None,
                })
                .collect();
            if let Some(values) = values {
                gathered.insert(name.clone(), Value::Array(values));
            }
        }
        Some(gathered)
    }

    /// A single output of a finished call.
    pub fn lookup_output(&self, fqn: &Fqn, name: &str) -> Option<Value> {
        self.call_outputs(fqn)?.remove(name)
    }

    /// Snapshot of every known instance.
    pub fn instances(&self) -> BTreeMap<InstanceKey, CallSnapshot> {
        self.calls
            .iter()
            .flat_map(|(fqn, call)| {
                call.shards
                    .iter()
                    .map(move |(index, snapshot)| (InstanceKey::new(fqn.clone(), *index), snapshot.clone()))
            })
            .collect()
    }

    /// (done, total) instance counts. Unexpanded scatters count as one.
    pub fn progress(&self) -> (usize, usize) {
        self.calls.values().fold((0, 0), |(done, total), call| {
            if !call.expanded {
                return (done, total + 1);
            }
            let finished = call.shards.values().filter(|s| s.status.is_done()).count();
            (done + finished, total + call.shards.len())
        })
    }
}
