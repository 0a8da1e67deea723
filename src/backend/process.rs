//! Process Backend
//!
//! Runs each call attempt as a bash script on the local machine, or inside
//! `docker run` for the docker kind. Every attempt gets its own directory:
//!
//! ```text
//! <root>/<workflow>/<workflow_id>/call-<name>[/shard-<i>]/attempt-<n>/
//!     command.sh   the rendered command
//!     script       wrapper that captures output and the return code
//!     stdout
//!     stderr
//!     rc           written atomically once the command exits
//! ```
//!
//! Because the return code lands in a file, a job started before an engine
//! restart can still be polled afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{BackendAdapter, BackendError, JobHandle, JobRequest, PollResult};

/// Docker client binary, overridable through `PIPEWRIGHT_DOCKER`.
pub static DOCKER_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("PIPEWRIGHT_DOCKER")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("docker"))
});

/// How a process backend launches commands.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    #[default]
    Local,
    Docker,
}

struct RunningJob {
    child: Child,
    _permit: OwnedSemaphorePermit,
}

/// Runs jobs as child processes, at most `concurrent_jobs` at a time.
pub struct ProcessBackend {
    name: String,
    kind: ProcessKind,
    root: PathBuf,
    slots: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, RunningJob>>,
}

impl ProcessBackend {
    pub fn new(
        name: impl Into<String>,
        kind: ProcessKind,
        root: impl Into<PathBuf>,
        concurrent_jobs: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            root: root.into(),
            slots: Arc::new(Semaphore::new(concurrent_jobs.max(1))),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// A local backend named `local` using one slot per CPU.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new("local", ProcessKind::Local, root, num_cpus::get())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Execution directory of one call attempt.
    pub fn call_root(&self, request: &JobRequest) -> PathBuf {
        let mut dir = self
            .root
            .join(&request.workflow_name)
            .join(request.workflow_id.to_string())
            .join(format!("call-{}", request.key.fqn.call_name()));
        if let Some(index) = request.key.index {
            dir = dir.join(format!("shard-{}", index));
        }
        dir.join(format!("attempt-{}", request.key.attempt))
    }

    fn jobs(&self) -> Result<MutexGuard<'_, HashMap<String, RunningJob>>, BackendError> {
        self.jobs
            .lock()
            .map_err(|_| BackendError::Transport("job table lock poisoned".to_string()))
    }

    fn runner(&self, request: &JobRequest, dir: &Path) -> Result<String, BackendError> {
        let command_script = dir.join("command.sh");
        match self.kind {
            ProcessKind::Local => Ok(format!("/bin/bash {}", shell_quote(&command_script))),
            ProcessKind::Docker => {
                let image = request.runtime.docker.as_deref().ok_or_else(|| {
                    BackendError::Rejected(format!("call {} has no docker image", request.key))
                })?;
                let dir = shell_quote(dir);
                Ok(format!(
                    "{} run --rm -v {}:{} -w {} {} /bin/bash {}",
                    shell_quote(&DOCKER_PATH),
                    dir,
                    dir,
                    dir,
                    shell_quote(Path::new(image)),
                    shell_quote(&command_script)
                ))
            }
        }
    }

    /// Writes `command.sh` and the wrapper `script` into the call directory.
    async fn write_scripts(&self, request: &JobRequest, dir: &Path) -> Result<PathBuf, BackendError> {
        let runner = self.runner(request, dir)?;

        let command_path = dir.join("command.sh");
        fs::write(&command_path, format!("#!/bin/bash\n{}\n", request.command)).await?;

        let rc = dir.join("rc");
        let rc_tmp = dir.join("rc.tmp");
        let wrapper = format!(
            "#!/bin/bash\ncd {dir}\n{runner} > {stdout} 2> {stderr}\necho $? > {rc_tmp}\nmv {rc_tmp} {rc}\n",
            dir = shell_quote(dir),
            runner = runner,
            stdout = shell_quote(&dir.join("stdout")),
            stderr = shell_quote(&dir.join("stderr")),
            rc_tmp = shell_quote(&rc_tmp),
            rc = shell_quote(&rc),
        );
        let script_path = dir.join("script");
        fs::write(&script_path, wrapper).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&command_path, std::fs::Permissions::from_mode(0o755)).await?;
            fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;
        }

        Ok(script_path)
    }

    fn release(&self, job_id: &str) -> Result<(), BackendError> {
        self.jobs()?.remove(job_id);
        Ok(())
    }
}

/// Single-quotes a path for bash.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

async fn read_rc(path: &Path) -> Result<Option<i32>, BackendError> {
    match fs::read_to_string(path).await {
        Ok(text) => text.trim().parse::<i32>().map(Some).map_err(|e| {
            BackendError::Transport(format!("unreadable return code in {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Runs a `kill` builtin through bash and reports whether it succeeded.
async fn signal(args: &str) -> Result<bool, BackendError> {
    let status = Command::new("/bin/bash")
        .arg("-c")
        .arg(format!("kill {}", args))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

/// Whether a process id is still alive, for jobs this process did not spawn.
async fn process_alive(pid: &str) -> Result<bool, BackendError> {
    signal(&format!("-0 {}", pid)).await
}

#[async_trait]
impl BackendAdapter for ProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, BackendError> {
        // Reject before waiting for a slot
        self.runner(request, Path::new("."))?;

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let mut dir = self.call_root(request);
        if dir.is_relative() {
            dir = std::env::current_dir()?.join(dir);
        }
        fs::create_dir_all(&dir).await?;
        match fs::remove_file(dir.join("rc")).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        let script = self.write_scripts(request, &dir).await?;

        let mut command = std::process::Command::new("/bin/bash");
        command
            .arg(&script)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group, so kill reaches the command's children too
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = Command::from(command).spawn()?;
        let job_id = child
            .id()
            .map(|pid| pid.to_string())
            .ok_or_else(|| BackendError::Transport("job exited before it could be tracked".to_string()))?;

        info!(
            "Backend '{}' started job {} for {} in {}",
            self.name,
            job_id,
            request.key,
            dir.display()
        );

        self.jobs()?.insert(
            job_id.clone(),
            RunningJob {
                child,
                _permit: permit,
            },
        );

        Ok(JobHandle {
            job_id,
            stdout: dir.join("stdout"),
            stderr: dir.join("stderr"),
            call_root: dir,
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollResult, BackendError> {
        let rc_path = handle.call_root.join("rc");
        let done = |rc| PollResult::Done {
            rc,
            stdout: handle.stdout.clone(),
            stderr: handle.stderr.clone(),
        };

        if let Some(rc) = read_rc(&rc_path).await? {
            self.release(&handle.job_id)?;
            return Ok(done(rc));
        }

        let tracked = {
            let mut jobs = self.jobs()?;
            match jobs.get_mut(&handle.job_id) {
                Some(job) => Some(job.child.try_wait()?.map(|status| status.code().unwrap_or(-1))),
                None => None,
            }
        };

        match tracked {
            Some(None) => Ok(PollResult::Running),
            Some(Some(code)) => {
                self.release(&handle.job_id)?;
                // The wrapper may have written rc between the two checks
                match read_rc(&rc_path).await? {
                    Some(rc) => Ok(done(rc)),
                    None => {
                        warn!("Job {} exited ({}) without a return code", handle.job_id, code);
                        Ok(PollResult::Failed { rc: code })
                    }
                }
            }
            None => {
                // Started by an earlier engine process
                if process_alive(&handle.job_id).await? {
                    Ok(PollResult::Running)
                } else {
                    match read_rc(&rc_path).await? {
                        Some(rc) => Ok(done(rc)),
                        None => Ok(PollResult::Failed { rc: -1 }),
                    }
                }
            }
        }
    }

    async fn kill(&self, handle: &JobHandle) -> Result<(), BackendError> {
        let tracked = self.jobs()?.remove(&handle.job_id);

        if !signal(&format!("-TERM -- -{}", handle.job_id)).await? {
            debug!("Process group {} was already gone", handle.job_id);
        }

        if let Some(mut job) = tracked {
            if let Err(e) = job.child.start_kill() {
                debug!("Job {} already exited: {}", handle.job_id, e);
            }
            // Reap in the background; the permit is released once it exits
            tokio::spawn(async move {
                let _ = job.child.wait().await;
            });
        }

        info!("Backend '{}' killed job {}", self.name, handle.job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{CallKey, Fqn, RuntimeAttributes, WorkflowId};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(command: &str, index: Option<usize>) -> JobRequest {
        JobRequest {
            workflow_id: WorkflowId::new(),
            workflow_name: "wf".to_string(),
            key: CallKey::new(Fqn::call("wf", "hello"), index, 1),
            command: command.to_string(),
            inputs: BTreeMap::new(),
            runtime: RuntimeAttributes::default(),
        }
    }

    async fn wait_for(backend: &ProcessBackend, handle: &JobHandle) -> PollResult {
        for _ in 0..200 {
            let result = backend.poll(handle).await.unwrap();
            if result != PollResult::Running {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {} did not finish", handle.job_id);
    }

    #[test]
    fn test_call_root_layout() {
        let backend = ProcessBackend::local("/runs");
        let req = request("true", Some(2));
        let root = backend.call_root(&req);

        assert_eq!(
            root,
            PathBuf::from(format!("/runs/wf/{}/call-hello/shard-2/attempt-1", req.workflow_id))
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(Path::new("/a b")), "'/a b'");
        assert_eq!(shell_quote(Path::new("it's")), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_submit_and_poll_success() {
        let dir = TempDir::new().unwrap();
        let backend = ProcessBackend::local(dir.path());

        let handle = backend.submit(&request("echo hello", None)).await.unwrap();
        let result = wait_for(&backend, &handle).await;

        assert_eq!(
            result,
            PollResult::Done {
                rc: 0,
                stdout: handle.stdout.clone(),
                stderr: handle.stderr.clone(),
            }
        );
        assert_eq!(std::fs::read_to_string(&handle.stdout).unwrap(), "hello\n");
        assert!(handle.call_root.join("command.sh").exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_as_done() {
        let dir = TempDir::new().unwrap();
        let backend = ProcessBackend::local(dir.path());

        let handle = backend
            .submit(&request("echo oops >&2; exit 3", None))
            .await
            .unwrap();
        match wait_for(&backend, &handle).await {
            PollResult::Done { rc, .. } => assert_eq!(rc, 3),
            other => panic!("unexpected poll result {:?}", other),
        }
        assert_eq!(std::fs::read_to_string(&handle.stderr).unwrap(), "oops\n");
    }

    #[tokio::test]
    async fn test_kill_stops_job() {
        let dir = TempDir::new().unwrap();
        let backend = ProcessBackend::local(dir.path());

        let handle = backend.submit(&request("sleep 30", None)).await.unwrap();
        assert_eq!(backend.poll(&handle).await.unwrap(), PollResult::Running);

        backend.kill(&handle).await.unwrap();
        assert_eq!(wait_for(&backend, &handle).await, PollResult::Failed { rc: -1 });
    }

    #[tokio::test]
    async fn test_poll_recovered_job() {
        let dir = TempDir::new().unwrap();
        let backend = ProcessBackend::local(dir.path());
        let handle = backend.submit(&request("echo recovered", None)).await.unwrap();
        wait_for(&backend, &handle).await;

        // A fresh backend knows nothing about the job but finds its rc file
        let restarted = ProcessBackend::local(dir.path());
        match restarted.poll(&handle).await.unwrap() {
            PollResult::Done { rc, .. } => assert_eq!(rc, 0),
            other => panic!("unexpected poll result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_docker_requires_image() {
        let dir = TempDir::new().unwrap();
        let backend = ProcessBackend::new("docker", ProcessKind::Docker, dir.path(), 1);

        let result = backend.submit(&request("echo hi", None)).await;
        assert!(matches!(result, Err(BackendError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_docker_runner_wraps_command() {
        let backend = ProcessBackend::new("docker", ProcessKind::Docker, "/runs", 1);
        let mut req = request("echo hi", None);
        req.runtime.docker = Some("ubuntu:22.04".to_string());

        let runner = backend.runner(&req, Path::new("/runs/x")).unwrap();
        assert!(runner.contains("run --rm -v '/runs/x':'/runs/x' -w '/runs/x' 'ubuntu:22.04'"));
        assert!(runner.ends_with("/bin/bash '/runs/x/command.sh'"));
    }
}
