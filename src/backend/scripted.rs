//! Scripted backend for engine tests.
//!
//! Every call follows a script keyed by its local call name and attempt.
//! Unscripted calls behave like `echo`: they succeed and print their
//! command without the leading `echo `.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use super::{BackendAdapter, BackendError, JobHandle, JobRequest, PollResult};
use crate::workflow::CallKey;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Behaviour {
    /// Finish with `rc`; `stdout` defaults to the echoed command
    Exit { rc: i32, stdout: Option<String> },
    RejectSubmit,
    /// Every poll fails with a transport error
    PollErrors,
    /// The job dies without a return code
    BackendFail { rc: i32 },
    /// Runs until killed
    Hang,
    /// Submit panics
    Panic,
}

impl Behaviour {
    pub(crate) fn succeed() -> Self {
        Self::Exit { rc: 0, stdout: None }
    }

    pub(crate) fn exit(rc: i32) -> Self {
        Self::Exit { rc, stdout: None }
    }
}

struct ScriptedJob {
    key: CallKey,
    behaviour: Behaviour,
}

pub(crate) struct ScriptedBackend {
    name: String,
    root: TempDir,
    scripts: HashMap<String, Vec<Behaviour>>,
    submissions: Mutex<Vec<JobRequest>>,
    kills: Mutex<Vec<CallKey>>,
    jobs: Mutex<HashMap<String, ScriptedJob>>,
    counter: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            root: TempDir::new().unwrap(),
            scripts: HashMap::new(),
            submissions: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Same behaviour for every attempt of a call.
    pub(crate) fn on(self, call: &str, behaviour: Behaviour) -> Self {
        self.on_attempts(call, vec![behaviour])
    }

    /// One behaviour per attempt; the last one repeats.
    pub(crate) fn on_attempts(mut self, call: &str, behaviours: Vec<Behaviour>) -> Self {
        self.scripts.insert(call.to_string(), behaviours);
        self
    }

    fn behaviour(&self, key: &CallKey) -> Behaviour {
        match self.scripts.get(key.fqn.call_name()) {
            Some(script) if !script.is_empty() => {
                let index = (key.attempt as usize).saturating_sub(1).min(script.len() - 1);
                script[index].clone()
            }
            _ => Behaviour::succeed(),
        }
    }

    pub(crate) fn submissions(&self) -> Vec<JobRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub(crate) fn submitted_keys(&self) -> Vec<String> {
        self.submissions()
            .iter()
            .map(|r| r.key.to_string())
            .collect()
    }

    pub(crate) fn kills(&self) -> Vec<CallKey> {
        self.kills.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, BackendError> {
        self.submissions.lock().unwrap().push(request.clone());

        let behaviour = self.behaviour(&request.key);
        match behaviour {
            Behaviour::RejectSubmit => {
                return Err(BackendError::Rejected(format!("scripted rejection of {}", request.key)));
            }
            Behaviour::Panic => panic!("scripted panic in {}", request.key),
            _ => {}
        }

        let job_id = format!("job-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let call_root: PathBuf = self.root.path().join(&job_id);
        std::fs::create_dir_all(&call_root)?;

        let stdout = call_root.join("stdout");
        let stderr = call_root.join("stderr");
        let printed = match &behaviour {
            Behaviour::Exit {
                stdout: Some(text), ..
            } => text.clone(),
            _ => request
                .command
                .strip_prefix("echo ")
                .unwrap_or(&request.command)
                .to_string(),
        };
        std::fs::write(&stdout, format!("{}\n", printed))?;
        std::fs::write(&stderr, "")?;

        let handle = JobHandle {
            job_id: job_id.clone(),
            call_root,
            stdout,
            stderr,
        };
        self.jobs.lock().unwrap().insert(
            job_id,
            ScriptedJob {
                key: request.key.clone(),
                behaviour,
            },
        );
        Ok(handle)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollResult, BackendError> {
        let behaviour = self
            .jobs
            .lock()
            .unwrap()
            .get(&handle.job_id)
            .map(|job| job.behaviour.clone())
            .ok_or_else(|| BackendError::Transport(format!("unknown job {}", handle.job_id)))?;

        match behaviour {
            Behaviour::Exit { rc, .. } => Ok(PollResult::Done {
                rc,
                stdout: handle.stdout.clone(),
                stderr: handle.stderr.clone(),
            }),
            Behaviour::PollErrors => Err(BackendError::Transport("scripted poll failure".to_string())),
            Behaviour::BackendFail { rc } => Ok(PollResult::Failed { rc }),
            Behaviour::Hang | Behaviour::RejectSubmit | Behaviour::Panic => Ok(PollResult::Running),
        }
    }

    async fn kill(&self, handle: &JobHandle) -> Result<(), BackendError> {
        let key = self
            .jobs
            .lock()
            .unwrap()
            .get(&handle.job_id)
            .map(|job| job.key.clone());
        if let Some(key) = key {
            self.kills.lock().unwrap().push(key);
        }
        Ok(())
    }
}
