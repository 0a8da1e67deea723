//! Call Execution Actor
//!
//! One tokio task per call instance. The actor owns the instance's status:
//! it submits the job, polls it, evaluates outputs, retries retryable
//! failures and reports every transition to its supervisor, in order,
//! after persisting it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::status::{CallExecutionStatus, CallFailure, CallOutputs};
use crate::backend::{BackendAdapter, JobHandle, JobRequest, PollResult};
use crate::config::EngineConfig;
use crate::store::{ScopeKey, Store};
use crate::workflow::{CallKey, CallNode, ContinueOnReturnCode, InstanceKey, OutputContext, OutputExpr, WorkflowId};

/// Messages from call actors to their supervisor.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Status {
        key: CallKey,
        status: CallExecutionStatus,
    },
    /// A job was submitted (or recovered) for this attempt
    JobStarted { key: CallKey, job: JobHandle },
    /// The attempt failed and the next one is about to start
    Retrying { key: CallKey, cause: CallFailure },
    /// The actor task panicked
    Crashed { instance: InstanceKey, message: String },
}

/// Polling settings shared by every actor of a run.
#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    pub poll_interval: Duration,
    pub max_poll_failures: u32,
}

impl From<&EngineConfig> for CallSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_poll_failures: config.max_poll_failures,
        }
    }
}

/// Collaborators handed to an actor by its supervisor.
pub struct CallContext {
    pub workflow_id: WorkflowId,
    pub backend: Arc<dyn BackendAdapter>,
    pub store: Arc<dyn Store>,
    pub settings: CallSettings,
    pub events: mpsc::UnboundedSender<CallEvent>,
    pub cancel: CancellationToken,
}

/// Drives one call instance through its attempts.
pub struct CallActor {
    request: JobRequest,
    outputs: BTreeMap<String, OutputExpr>,
    continue_on_return_code: ContinueOnReturnCode,
    max_retries: u32,
    recover: Option<JobHandle>,
    context: CallContext,
}

impl CallActor {
    pub fn new(request: JobRequest, node: &CallNode, max_retries: u32, context: CallContext) -> Self {
        Self {
            request,
            outputs: node.outputs.clone(),
            continue_on_return_code: node.definition.continue_on_return_code.clone(),
            max_retries,
            recover: None,
            context,
        }
    }

    /// Resumes polling an already submitted job instead of submitting.
    pub fn recover_from(mut self, handle: JobHandle) -> Self {
        self.recover = Some(handle);
        self
    }

    pub fn key(&self) -> &CallKey {
        &self.request.key
    }

    /// Runs attempts until one ends without a retry.
    pub async fn run(mut self) {
        loop {
            let status = self.run_attempt().await;

            if let CallExecutionStatus::Failed(cause) = &status {
                if self.should_retry(cause) {
                    let key = self.request.key.clone();
                    warn!(
                        "Call {} failed ({}), retrying as attempt {}",
                        key,
                        cause,
                        key.attempt + 1
                    );
                    self.persist(&status).await;
                    self.send(CallEvent::Retrying {
                        key: key.clone(),
                        cause: cause.clone(),
                    });
                    self.request.key = key.next_attempt();
                    continue;
                }
            }

            self.transition(status).await;
            return;
        }
    }

    fn should_retry(&self, cause: &CallFailure) -> bool {
        cause.is_retryable()
            && self.request.key.attempt <= self.max_retries
            && !self.context.cancel.is_cancelled()
    }

    /// One attempt. Returns its final status without reporting it.
    async fn run_attempt(&mut self) -> CallExecutionStatus {
        self.transition(CallExecutionStatus::Starting).await;
        if self.context.cancel.is_cancelled() {
            return CallExecutionStatus::Aborted;
        }

        let handle = match self.recover.take() {
            Some(handle) => {
                info!("Resuming {} from job {}", self.request.key, handle.job_id);
                handle
            }
            None => {
                let submitted = tokio::select! {
                    biased;
                    _ = self.context.cancel.cancelled() => return CallExecutionStatus::Aborted,
                    result = self.context.backend.submit(&self.request) => result,
                };
                match submitted {
                    Ok(handle) => handle,
                    Err(e) => {
                        error!("Submitting {} failed: {}", self.request.key, e);
                        return CallExecutionStatus::Failed(CallFailure::Submission(e.to_string()));
                    }
                }
            }
        };

        self.record_job(&handle).await;
        self.transition(CallExecutionStatus::Running).await;
        self.poll_until_finished(&handle).await
    }

    async fn poll_until_finished(&self, handle: &JobHandle) -> CallExecutionStatus {
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.context.cancel.cancelled() => return self.abort(handle).await,
                _ = tokio::time::sleep(self.context.settings.poll_interval) => {}
            }

            match self.context.backend.poll(handle).await {
                Ok(PollResult::Running) => failures = 0,
                Ok(PollResult::Done { rc, stdout, stderr }) => {
                    return self.complete(handle, rc, &stdout, &stderr).await;
                }
                Ok(PollResult::Failed { rc }) => {
                    warn!("Job {} for {} failed with rc {}", handle.job_id, self.request.key, rc);
                    return CallExecutionStatus::Failed(CallFailure::NonZeroExit { rc });
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.context.settings.max_poll_failures {
                        error!(
                            "Giving up on job {} for {} after {} poll failures: {}",
                            handle.job_id, self.request.key, failures, e
                        );
                        return CallExecutionStatus::Failed(CallFailure::BackendUnavailable(e.to_string()));
                    }
                    warn!(
                        "Polling job {} failed ({}/{}): {}",
                        handle.job_id, failures, self.context.settings.max_poll_failures, e
                    );
                }
            }
        }
    }

    async fn complete(&self, handle: &JobHandle, rc: i32, stdout: &Path, stderr: &Path) -> CallExecutionStatus {
        if !self.continue_on_return_code.accepts(rc) {
            warn!("Call {} exited with return code {}", self.request.key, rc);
            return CallExecutionStatus::Failed(CallFailure::NonZeroExit { rc });
        }

        match self.evaluate_outputs(handle, stdout, stderr).await {
            Ok(outputs) => CallExecutionStatus::Done(outputs),
            Err(cause) => {
                error!("Outputs of {} failed: {}", self.request.key, cause);
                CallExecutionStatus::Failed(cause)
            }
        }
    }

    /// Reads every output on the blocking pool; output files can be large.
    async fn evaluate_outputs(
        &self,
        handle: &JobHandle,
        stdout: &Path,
        stderr: &Path,
    ) -> Result<CallOutputs, CallFailure> {
        let expressions = self.outputs.clone();
        let call_root = handle.call_root.clone();
        let stdout = stdout.to_path_buf();
        let stderr = stderr.to_path_buf();
        let bindings = self.request.inputs.clone();

        tokio::task::spawn_blocking(move || {
            let ctx = OutputContext {
                call_root: &call_root,
                stdout: &stdout,
                stderr: &stderr,
                bindings: &bindings,
            };
            let mut outputs = CallOutputs::new();
            for (name, expr) in &expressions {
                let value = expr
                    .evaluate(&ctx)
                    .map_err(|message| CallFailure::OutputEvaluation {
                        output: name.clone(),
                        message,
                    })?;
                outputs.insert(name.clone(), value);
            }
            Ok(outputs)
        })
        .await
        .map_err(|e| CallFailure::Crashed(e.to_string()))?
    }

    async fn abort(&self, handle: &JobHandle) -> CallExecutionStatus {
        info!("Aborting {} (job {})", self.request.key, handle.job_id);
        if let Err(e) = self.context.backend.kill(handle).await {
            warn!("Killing job {} failed: {}", handle.job_id, e);
        }
        CallExecutionStatus::Aborted
    }

    /// Stores the job handle and log locations under the attempt's scope.
    async fn record_job(&self, handle: &JobHandle) {
        let scope = ScopeKey::call(self.context.workflow_id, &self.request.key);
        let mut entries = vec![
            ("stdout", handle.stdout.display().to_string()),
            ("stderr", handle.stderr.display().to_string()),
        ];
        match serde_json::to_string(handle) {
            Ok(job) => entries.insert(0, ("job", job)),
            // Without a job row a restart reruns the attempt
            Err(e) => warn!("Could not encode job {} of {}: {}", handle.job_id, self.request.key, e),
        }
        for (key, value) in entries {
            if let Err(e) = self.context.store.upsert_key_value(&scope, key, &value).await {
                warn!("Could not record {} for {}: {}", key, self.request.key, e);
            }
        }

        self.send(CallEvent::JobStarted {
            key: self.request.key.clone(),
            job: handle.clone(),
        });
    }

    async fn transition(&self, status: CallExecutionStatus) {
        debug!("Call {} is {}", self.request.key, status);
        self.persist(&status).await;
        self.send(CallEvent::Status {
            key: self.request.key.clone(),
            status,
        });
    }

    async fn persist(&self, status: &CallExecutionStatus) {
        if let Err(e) = self
            .context
            .store
            .upsert_call_status(self.context.workflow_id, &self.request.key, status)
            .await
        {
            warn!("Could not persist status of {}: {}", self.request.key, e);
        }
    }

    fn send(&self, event: CallEvent) {
        if self.context.events.send(event).is_err() {
            debug!("Supervisor for {} is gone", self.request.key);
        }
    }
}

/// Spawns an actor with a monitor that reports a panic as a crash.
pub fn spawn_actor(actor: CallActor) {
    let instance = actor.key().instance();
    let events = actor.context.events.clone();
    let task = tokio::spawn(actor.run());

    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("Call actor for {} crashed: {}", instance, e);
            let _ = events.send(CallEvent::Crashed {
                instance,
                message: e.to_string(),
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Behaviour, ScriptedBackend};
    use crate::store::tests::record;
    use crate::store::MemoryStore;
    use crate::workflow::parser::parse_workflow;
    use crate::workflow::{Fqn, WorkflowState};

    const WORKFLOW: &str = r#"
name: wf
calls:
  - id: hello
    command: echo hi
    outputs:
      greeting: stdout()
  - id: count
    command: echo 3
    continue_on_return_code: [2]
    outputs:
      n: read_int("missing.txt")
  - id: lines
    command: echo a
    outputs:
      all: read_lines("stdout")
      dir: file("stdout")
"#;

    struct Harness {
        backend: Arc<ScriptedBackend>,
        store: Arc<MemoryStore>,
        workflow_id: WorkflowId,
        events: mpsc::UnboundedReceiver<CallEvent>,
        sender: mpsc::UnboundedSender<CallEvent>,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn new(backend: ScriptedBackend) -> Self {
            let store = Arc::new(MemoryStore::new());
            let workflow = record(WorkflowState::Running);
            let workflow_id = workflow.id;
            store.upsert_workflow(workflow).await.unwrap();
            let (sender, events) = mpsc::unbounded_channel();
            Self {
                backend: Arc::new(backend),
                store,
                workflow_id,
                events,
                sender,
                cancel: CancellationToken::new(),
            }
        }

        fn actor(&self, call: &str, max_retries: u32) -> CallActor {
            let graph = parse_workflow(WORKFLOW, None).unwrap();
            let node = graph.call(&Fqn::call("wf", call)).unwrap();
            let request = JobRequest {
                workflow_id: self.workflow_id,
                workflow_name: "wf".to_string(),
                key: CallKey::new(node.fqn.clone(), None, 1),
                command: node.definition.command.clone(),
                inputs: BTreeMap::new(),
                runtime: node.definition.runtime.clone(),
            };
            let context = CallContext {
                workflow_id: self.workflow_id,
                backend: self.backend.clone(),
                store: self.store.clone(),
                settings: CallSettings {
                    poll_interval: Duration::from_millis(1),
                    max_poll_failures: 2,
                },
                events: self.sender.clone(),
                cancel: self.cancel.child_token(),
            };
            CallActor::new(request, node, max_retries, context)
        }

        /// Statuses received so far, as `key status` strings.
        fn drain(&mut self) -> Vec<String> {
            let mut seen = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                match event {
                    CallEvent::Status { key, status } => seen.push(format!("{} {}", key, status)),
                    CallEvent::Retrying { key, .. } => seen.push(format!("{} retrying", key)),
                    CallEvent::JobStarted { .. } | CallEvent::Crashed { .. } => {}
                }
            }
            seen
        }

        fn last_status(&mut self) -> Option<CallExecutionStatus> {
            let mut last = None;
            while let Ok(event) = self.events.try_recv() {
                if let CallEvent::Status { status, .. } = event {
                    last = Some(status);
                }
            }
            last
        }
    }

    #[tokio::test]
    async fn test_successful_call_reports_every_transition() {
        let mut harness = Harness::new(ScriptedBackend::new("local")).await;
        harness.actor("hello", 0).run().await;

        assert_eq!(
            harness.drain(),
            vec![
                "wf.hello:NA:1 Starting",
                "wf.hello:NA:1 Running",
                "wf.hello:NA:1 Done",
            ]
        );

        let rows = harness.store.call_statuses(harness.workflow_id).await.unwrap();
        let mut expected = CallOutputs::new();
        expected.insert("greeting".to_string(), serde_json::json!("hi"));
        assert_eq!(rows[0].status, CallExecutionStatus::Done(expected));

        let scope = ScopeKey::call(harness.workflow_id, &CallKey::new(Fqn::call("wf", "hello"), None, 1));
        assert!(harness.store.query_value(&scope, "job").await.unwrap().is_some());
        assert!(harness.store.query_value(&scope, "stdout").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_outputs_read_files_in_the_call_root() {
        let mut harness = Harness::new(ScriptedBackend::new("local")).await;
        harness.actor("lines", 0).run().await;

        let Some(CallExecutionStatus::Done(outputs)) = harness.last_status() else {
            panic!("lines did not finish");
        };
        assert_eq!(outputs["all"], serde_json::json!(["a"]));
        assert!(outputs["dir"].as_str().unwrap().ends_with("stdout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unencodable_job_handle_is_not_recorded() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        use std::path::PathBuf;

        let mut harness = Harness::new(ScriptedBackend::new("local")).await;
        let handle = JobHandle {
            job_id: "lost".to_string(),
            call_root: PathBuf::from(OsStr::from_bytes(b"/tmp/\xff")),
            stdout: PathBuf::from("/tmp/stdout"),
            stderr: PathBuf::from("/tmp/stderr"),
        };
        harness.actor("hello", 0).recover_from(handle).run().await;

        let scope = ScopeKey::call(harness.workflow_id, &CallKey::new(Fqn::call("wf", "hello"), None, 1));
        assert_eq!(harness.store.query_value(&scope, "job").await.unwrap(), None);
        assert_eq!(
            harness.store.query_value(&scope, "stdout").await.unwrap().as_deref(),
            Some("/tmp/stdout")
        );
        assert!(matches!(
            harness.last_status(),
            Some(CallExecutionStatus::Failed(CallFailure::BackendUnavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_retry_keeps_prior_attempt_rows() {
        let backend = ScriptedBackend::new("local")
            .on_attempts("hello", vec![Behaviour::exit(1), Behaviour::succeed()]);
        let mut harness = Harness::new(backend).await;
        harness.actor("hello", 1).run().await;

        assert_eq!(
            harness.drain(),
            vec![
                "wf.hello:NA:1 Starting",
                "wf.hello:NA:1 Running",
                "wf.hello:NA:1 retrying",
                "wf.hello:NA:2 Starting",
                "wf.hello:NA:2 Running",
                "wf.hello:NA:2 Done",
            ]
        );

        let rows = harness.store.call_statuses(harness.workflow_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].status,
            CallExecutionStatus::Failed(CallFailure::NonZeroExit { rc: 1 })
        );
        assert!(rows[1].status.is_done());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let backend = ScriptedBackend::new("local").on("hello", Behaviour::exit(1));
        let mut harness = Harness::new(backend).await;
        harness.actor("hello", 2).run().await;

        assert_eq!(harness.backend.submissions().len(), 3);
        assert_eq!(
            harness.last_status(),
            Some(CallExecutionStatus::Failed(CallFailure::NonZeroExit { rc: 1 }))
        );
    }

    #[tokio::test]
    async fn test_output_evaluation_is_not_retried() {
        let backend = ScriptedBackend::new("local").on("count", Behaviour::exit(2));
        let mut harness = Harness::new(backend).await;
        harness.actor("count", 3).run().await;

        assert_eq!(harness.backend.submissions().len(), 1);
        assert!(matches!(
            harness.last_status(),
            Some(CallExecutionStatus::Failed(CallFailure::OutputEvaluation { output, .. })) if output == "n"
        ));
    }

    #[tokio::test]
    async fn test_poll_errors_become_backend_unavailable() {
        let backend = ScriptedBackend::new("local").on("hello", Behaviour::PollErrors);
        let mut harness = Harness::new(backend).await;
        harness.actor("hello", 0).run().await;

        assert!(matches!(
            harness.last_status(),
            Some(CallExecutionStatus::Failed(CallFailure::BackendUnavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_ignores_accepted_codes() {
        let backend = ScriptedBackend::new("local").on("count", Behaviour::BackendFail { rc: 2 });
        let mut harness = Harness::new(backend).await;
        harness.actor("count", 0).run().await;

        assert_eq!(
            harness.last_status(),
            Some(CallExecutionStatus::Failed(CallFailure::NonZeroExit { rc: 2 }))
        );
    }

    #[tokio::test]
    async fn test_submit_rejection() {
        let backend = ScriptedBackend::new("local").on("hello", Behaviour::RejectSubmit);
        let mut harness = Harness::new(backend).await;
        harness.actor("hello", 0).run().await;

        assert!(matches!(
            harness.last_status(),
            Some(CallExecutionStatus::Failed(CallFailure::Submission(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_job() {
        let backend = ScriptedBackend::new("local").on("hello", Behaviour::Hang);
        let mut harness = Harness::new(backend).await;
        let actor = harness.actor("hello", 3);
        let task = tokio::spawn(actor.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(harness.last_status(), Some(CallExecutionStatus::Aborted));
        assert_eq!(harness.backend.kills().len(), 1);
        assert_eq!(harness.backend.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_never_submits() {
        let mut harness = Harness::new(ScriptedBackend::new("local")).await;
        harness.cancel.cancel();
        harness.actor("hello", 0).run().await;

        assert!(harness.backend.submissions().is_empty());
        assert_eq!(harness.last_status(), Some(CallExecutionStatus::Aborted));
    }
}
