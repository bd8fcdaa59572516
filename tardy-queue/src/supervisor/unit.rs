use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    execution::{Outcome, Worker},
    supervisor::control::ShutdownKind,
    JobId, JobRecord, QueueAdapter, QueueError, QueueResult, WorkerIdentity,
};

/// How an execution unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// Ran the job lifecycle to the end
    Success,
    /// Stopped because the supervisor asked it to
    Terminated,
    /// Exited with an error of its own
    Failed(String),
    /// Killed by a signal or panicked outside the job
    Crashed(String),
}

impl UnitExit {
    /// Counts toward the crash-loop guard
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Crashed(_))
    }
}

/// Signalling side of a running unit
pub trait UnitControl: Send + Sync {
    /// Ask the unit to stop
    fn terminate(&self, kind: ShutdownKind);
    /// Stop the unit without waiting for it
    fn kill(&self);
    fn describe(&self) -> String;
}

/// An isolated execution of one claimed job
#[async_trait]
pub trait ExecutionUnit: Send {
    fn control(&self) -> Arc<dyn UnitControl>;
    /// Wait for the unit to end
    async fn wait(&mut self) -> UnitExit;
}

/// Creates execution units for claimed jobs
pub trait Spawner: Send + Sync {
    fn spawn(&self, job: JobRecord, identity: WorkerIdentity) -> QueueResult<Box<dyn ExecutionUnit>>;
}

/// Runs each job on its own tokio task inside the supervisor process
pub struct TaskSpawner {
    adapter: QueueAdapter,
}

impl TaskSpawner {
    pub fn new(adapter: QueueAdapter) -> Self {
        Self { adapter }
    }
}

impl Spawner for TaskSpawner {
    fn spawn(&self, job: JobRecord, identity: WorkerIdentity) -> QueueResult<Box<dyn ExecutionUnit>> {
        let job_id = job.id;
        let worker: Worker = self.adapter.worker(identity);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => None,
                outcome = worker.run(job) => Some(outcome),
            }
        });

        Ok(Box::new(TaskUnit {
            control: Arc::new(TaskControl {
                job_id,
                token,
                abort: handle.abort_handle(),
            }),
            handle: Some(handle),
        }))
    }
}

struct TaskUnit {
    control: Arc<TaskControl>,
    handle: Option<JoinHandle<Option<QueueResult<Outcome>>>>,
}

struct TaskControl {
    job_id: JobId,
    token: CancellationToken,
    abort: AbortHandle,
}

impl UnitControl for TaskControl {
    fn terminate(&self, _kind: ShutdownKind) {
        self.token.cancel();
    }

    fn kill(&self) {
        self.abort.abort();
    }

    fn describe(&self) -> String {
        format!("task for job {}", self.job_id)
    }
}

#[async_trait]
impl ExecutionUnit for TaskUnit {
    fn control(&self) -> Arc<dyn UnitControl> {
        self.control.clone()
    }

    async fn wait(&mut self) -> UnitExit {
        let Some(handle) = self.handle.take() else {
            return UnitExit::Terminated;
        };
        match handle.await {
            Ok(Some(Ok(outcome))) => {
                debug!(?outcome, "task unit finished");
                UnitExit::Success
            }
            Ok(Some(Err(e))) => UnitExit::Failed(e.to_string()),
            Ok(None) => UnitExit::Terminated,
            Err(e) if e.is_cancelled() => UnitExit::Terminated,
            Err(e) => UnitExit::Crashed(e.to_string()),
        }
    }
}

/// Runs each job in a child process: `<program> <args..> perform <job-id> --worker <name>`
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary
    pub fn current_exe() -> QueueResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments placed before the `perform` subcommand
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, job: &JobRecord, identity: &WorkerIdentity) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("perform")
            .arg(job.id.to_string())
            .arg("--worker")
            .arg(&identity.name)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, job: JobRecord, identity: WorkerIdentity) -> QueueResult<Box<dyn ExecutionUnit>> {
        let child = self
            .command(&job, &identity)
            .spawn()
            .map_err(|e| QueueError::Spawn(format!("{}: {}", self.program.display(), e)))?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| QueueError::Spawn("child exited before reporting a pid".to_string()))?;

        debug!(pid, job_id = %job.id, "spawned process unit");
        Ok(Box::new(ProcessUnit {
            child,
            control: Arc::new(ProcessControl {
                pid: Pid::from_raw(pid),
                terminated: AtomicBool::new(false),
            }),
        }))
    }
}

struct ProcessUnit {
    child: Child,
    control: Arc<ProcessControl>,
}

struct ProcessControl {
    pid: Pid,
    terminated: AtomicBool,
}

impl ProcessControl {
    fn send(&self, signal: Signal) {
        if let Err(e) = kill(self.pid, signal) {
            warn!(pid = %self.pid, %signal, error = %e, "failed to signal unit");
        }
    }
}

impl UnitControl for ProcessControl {
    fn terminate(&self, kind: ShutdownKind) {
        self.terminated.store(true, Ordering::SeqCst);
        self.send(kind.signal());
    }

    fn kill(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.send(Signal::SIGKILL);
    }

    fn describe(&self) -> String {
        format!("pid {}", self.pid)
    }
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    fn control(&self) -> Arc<dyn UnitControl> {
        self.control.clone()
    }

    async fn wait(&mut self) -> UnitExit {
        match self.child.wait().await {
            Ok(status) => classify(status, self.control.terminated.load(Ordering::SeqCst)),
            Err(e) => UnitExit::Crashed(e.to_string()),
        }
    }
}

fn classify(status: ExitStatus, terminated: bool) -> UnitExit {
    use std::os::unix::process::ExitStatusExt;

    if status.success() {
        UnitExit::Success
    } else if terminated {
        UnitExit::Terminated
    } else if let Some(signal) = status.signal() {
        UnitExit::Crashed(format!("killed by signal {}", signal))
    } else {
        UnitExit::Failed(format!("exited with {}", status))
    }
}
