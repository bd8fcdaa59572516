//! Command line surface: pool control (`start`, `stop`, `restart`, `run`),
//! queue maintenance (`enqueue`, `clear`, `count`) and the hidden `perform`
//! entry point used by process-isolated units.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{error, info};

use crate::{
    adapter::{EnqueueOptions, QueueAdapter},
    backend::{sqlite::SqliteStore, JobStore},
    codec::PayloadEnvelope,
    config::{parse_queue_list, Isolation, SupervisorConfig, WorkerConfig},
    job::JobRegistry,
    observability::init_tracing,
    supervisor::{control::restore_default_disposition, control_channel, forward_os_signals, pidfile::is_alive, PidFile, ProcessSpawner, Spawner, Supervisor, SupervisorExit, TaskSpawner},
    types::PriorityRange,
    JobId, QueueError, WorkerIdentity,
};

/// How long `start` waits for the pool to write its pid file
const START_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "tardy", version, about = "Durable background job queue")]
pub struct Cli {
    /// Application root; pid file, restart file and default database live under it
    #[arg(long, global = true, env = "TARDY_ROOT")]
    pub root: Option<PathBuf>,

    /// Job store location
    #[arg(long, global = true, env = "TARDY_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the worker pool in the background
    Start(PoolArgs),
    /// Stop the background worker pool
    Stop(MarkerArgs),
    /// Ask the running pool to restart its workers
    Restart(MarkerArgs),
    /// Run the worker pool in the foreground
    Run(PoolArgs),
    /// Add a job to the queue
    Enqueue(EnqueueArgs),
    /// Delete every job
    Clear,
    /// Print the number of stored jobs
    Count,
    /// Run one claimed job and exit
    #[command(hide = true)]
    Perform {
        job_id: JobId,
        #[arg(long)]
        worker: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct MarkerArgs {
    /// Directory holding the pid file
    #[arg(long)]
    pub pid_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PoolArgs {
    /// Number of worker slots
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Only claim jobs with at least this priority
    #[arg(long, allow_hyphen_values = true)]
    pub min_priority: Option<i32>,

    /// Only claim jobs with at most this priority
    #[arg(long, allow_hyphen_values = true)]
    pub max_priority: Option<i32>,

    /// Comma separated queue preference list; `*` matches any queue
    #[arg(long)]
    pub queues: Option<String>,

    /// Seconds an idle slot waits before polling again
    #[arg(long)]
    pub sleep_delay: Option<u64>,

    #[arg(long, value_enum)]
    pub isolation: Option<IsolationArg>,

    #[command(flatten)]
    pub marker: MarkerArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationArg {
    Process,
    Task,
}

impl From<IsolationArg> for Isolation {
    fn from(arg: IsolationArg) -> Self {
        match arg {
            IsolationArg::Process => Isolation::Process,
            IsolationArg::Task => Isolation::Task,
        }
    }
}

impl PoolArgs {
    /// Flags reproducing these options on a child command line
    fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(workers) = self.workers {
            args.extend(["--workers".into(), workers.to_string().into()]);
        }
        if let Some(min) = self.min_priority {
            args.extend(["--min-priority".into(), min.to_string().into()]);
        }
        if let Some(max) = self.max_priority {
            args.extend(["--max-priority".into(), max.to_string().into()]);
        }
        if let Some(queues) = &self.queues {
            args.extend(["--queues".into(), queues.into()]);
        }
        if let Some(delay) = self.sleep_delay {
            args.extend(["--sleep-delay".into(), delay.to_string().into()]);
        }
        if let Some(isolation) = self.isolation {
            let value = match isolation {
                IsolationArg::Process => "process",
                IsolationArg::Task => "task",
            };
            args.extend(["--isolation".into(), value.into()]);
        }
        if let Some(dir) = &self.marker.pid_dir {
            args.extend(["--pid-dir".into(), dir.into()]);
        }
        args
    }
}

#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    /// Registered job type
    pub job_type: String,

    /// Job arguments as JSON
    #[arg(long, default_value = "{}")]
    pub args: String,

    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long, allow_hyphen_values = true)]
    pub priority: Option<i32>,

    /// RFC 3339 timestamp before which the job must not run
    #[arg(long)]
    pub run_at: Option<DateTime<Utc>>,
}

/// What the process should do once the command returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    /// Re-deliver a shutdown signal to ourselves with its default action
    Reraise(Signal),
}

impl Cli {
    fn root(&self) -> PathBuf {
        self.root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Environment configuration with command line overrides applied
    pub fn supervisor_config(&self, pool: Option<&PoolArgs>, marker: Option<&MarkerArgs>) -> SupervisorConfig {
        let mut config = SupervisorConfig::from_env(self.root());
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(pool) = pool {
            if let Some(workers) = pool.workers {
                config = config.with_workers(workers);
            }
            if let Some(delay) = pool.sleep_delay {
                config = config.with_poll_interval(Duration::from_secs(delay));
            }
            if let Some(isolation) = pool.isolation {
                config = config.with_isolation(isolation.into());
            }
        }
        if let Some(dir) = marker.or(pool.map(|p| &p.marker)).and_then(|m| m.pid_dir.clone()) {
            config = config.with_pid_dir(dir);
        }
        config
    }

    pub fn worker_config(&self, pool: Option<&PoolArgs>) -> WorkerConfig {
        let mut config = WorkerConfig::from_env();
        if let Some(pool) = pool {
            if pool.min_priority.is_some() || pool.max_priority.is_some() {
                let range = PriorityRange::new(
                    pool.min_priority.or(config.priority_range.min),
                    pool.max_priority.or(config.priority_range.max),
                );
                config = config.with_priority_range(range);
            }
            if let Some(queues) = &pool.queues {
                config = config.with_queues(parse_queue_list(queues));
            }
        }
        config
    }

    /// Global flags reproduced for child processes
    fn global_args(&self, config: &SupervisorConfig) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--root".into(),
            config.root().into(),
            "--database-url".into(),
            config.database_url.clone().into(),
        ];
        if self.log_json {
            args.push("--log-json".into());
        }
        args
    }
}

/// Parse the command line, run the command and map the result to an exit code.
///
/// Usage errors and command failures exit with 1.
pub fn main_entry(registry: JobRegistry) -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    // A second subscriber only fails when embedding code installed its own
    let _ = init_tracing(cli.log_json);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("tardy: {}", e);
            return ExitCode::from(1);
        }
    };
    let result = runtime.block_on(execute(cli, registry));
    drop(runtime);

    match result {
        Ok(Exit::Success) => ExitCode::SUCCESS,
        Ok(Exit::Reraise(signal)) => reraise(signal),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("tardy: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Run one parsed command
pub async fn execute(cli: Cli, registry: JobRegistry) -> anyhow::Result<Exit> {
    match &cli.command {
        Command::Start(pool) => start(&cli, pool).await,
        Command::Stop(marker) => stop(&cli, marker).await,
        Command::Restart(marker) => restart(&cli, marker),
        Command::Run(pool) => run(&cli, pool, registry).await,
        Command::Enqueue(args) => enqueue(&cli, args, registry).await,
        Command::Clear => {
            let removed = adapter(&cli, None, registry).await?.clear().await?;
            println!("Deleted {} jobs", removed);
            Ok(Exit::Success)
        }
        Command::Count => {
            println!("{}", adapter(&cli, None, registry).await?.count().await?);
            Ok(Exit::Success)
        }
        Command::Perform { job_id, worker } => perform(&cli, *job_id, worker, registry).await,
    }
}

async fn open_store(config: &SupervisorConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    std::fs::create_dir_all(config.root().join("tmp")).context("creating tmp directory")?;
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening job store {}", config.database_url))?;
    Ok(Arc::new(store))
}

async fn adapter(cli: &Cli, pool: Option<&PoolArgs>, registry: JobRegistry) -> anyhow::Result<QueueAdapter> {
    let config = cli.supervisor_config(pool, None);
    let store = open_store(&config).await?;
    Ok(QueueAdapter::with_config(store, Arc::new(registry), cli.worker_config(pool)))
}

async fn run(cli: &Cli, pool: &PoolArgs, registry: JobRegistry) -> anyhow::Result<Exit> {
    let config = cli.supervisor_config(Some(pool), None);
    let adapter = adapter(cli, Some(pool), registry).await?;

    let spawner: Arc<dyn Spawner> = match config.isolation {
        Isolation::Task => Arc::new(TaskSpawner::new(adapter.clone())),
        Isolation::Process => Arc::new(ProcessSpawner::current_exe()?.with_args(cli.global_args(&config))),
    };

    let (handle, control) = control_channel();
    let signals = forward_os_signals(handle)?;

    let supervisor = Supervisor::new(config, adapter.config().clone(), adapter.store().clone(), spawner);
    let exit = supervisor.run(control).await;
    signals.abort();

    match exit? {
        SupervisorExit::Shutdown(kind) => Ok(Exit::Reraise(kind.signal())),
        SupervisorExit::ControlClosed => Ok(Exit::Success),
    }
}

async fn start(cli: &Cli, pool: &PoolArgs) -> anyhow::Result<Exit> {
    let config = cli.supervisor_config(Some(pool), None);
    let pid_file = PidFile::new(config.pid_file());
    if let Some(pid) = pid_file.live_pid()? {
        return Err(QueueError::AlreadyRunning { pid }.into());
    }

    let mut command = std::process::Command::new(std::env::current_exe()?);
    command
        .args(cli.global_args(&config))
        .arg("run")
        .args(pool.to_args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        // Own process group, so terminal signals aimed at us do not reach the pool
        .process_group(0);
    let mut child = command.spawn().context("spawning worker pool")?;
    let child_pid = i32::try_from(child.id()).context("child pid out of range")?;

    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    loop {
        if pid_file.read()? == Some(child_pid) {
            println!("tardy: started (pid {})", child_pid);
            info!(pid = child_pid, "worker pool started");
            return Ok(Exit::Success);
        }
        if let Some(status) = child.try_wait()? {
            if pid_file.read()? == Some(child_pid) {
                pid_file.remove()?;
            }
            bail!("worker pool exited during startup ({})", status);
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = child.kill();
            if pid_file.read()? == Some(child_pid) {
                pid_file.remove()?;
            }
            bail!("worker pool did not write {} in time", pid_file.path().display());
        }
        tokio::time::sleep(STATUS_POLL).await;
    }
}

/// Pid of the running pool, or an error naming the missing or stale pid file
fn running_pid(config: &SupervisorConfig) -> anyhow::Result<i32> {
    let pid_file = PidFile::new(config.pid_file());
    match pid_file.read()? {
        Some(pid) if is_alive(pid) => Ok(pid),
        Some(pid) => Err(QueueError::NotRunning(format!("{} names dead process {}", pid_file.path().display(), pid)).into()),
        None => Err(QueueError::NotRunning(format!("{} not found", pid_file.path().display())).into()),
    }
}

async fn stop(cli: &Cli, marker: &MarkerArgs) -> anyhow::Result<Exit> {
    let config = cli.supervisor_config(None, Some(marker));
    let pid = running_pid(&config)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).with_context(|| format!("signalling pid {}", pid))?;

    let deadline = tokio::time::Instant::now() + config.shutdown_grace + START_TIMEOUT;
    while is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            bail!("worker pool (pid {}) did not stop in time", pid);
        }
        tokio::time::sleep(STATUS_POLL).await;
    }
    println!("tardy: stopped (pid {})", pid);
    Ok(Exit::Success)
}

fn restart(cli: &Cli, marker: &MarkerArgs) -> anyhow::Result<Exit> {
    let config = cli.supervisor_config(None, Some(marker));
    let pid = running_pid(&config)?;
    kill(Pid::from_raw(pid), Signal::SIGHUP).with_context(|| format!("signalling pid {}", pid))?;
    println!("tardy: restart requested (pid {})", pid);
    Ok(Exit::Success)
}

async fn enqueue(cli: &Cli, args: &EnqueueArgs, registry: JobRegistry) -> anyhow::Result<Exit> {
    let job_args: serde_json::Value = serde_json::from_str(&args.args).context("--args must be JSON")?;
    let payload = registry.encode_envelope(&PayloadEnvelope::new(args.job_type.clone(), job_args))?;

    let adapter = adapter(cli, None, registry).await?;
    let mut options = EnqueueOptions::new();
    options.queue = args.queue.clone();
    options.priority = args.priority;
    options.run_at = args.run_at;

    let record = adapter.enqueue_payload(payload, options).await?;
    println!("{}", record.id);
    Ok(Exit::Success)
}

async fn perform(cli: &Cli, job_id: JobId, worker: &str, registry: JobRegistry) -> anyhow::Result<Exit> {
    let adapter = adapter(cli, None, registry).await?;
    let identity = WorkerIdentity::new(worker);
    adapter.worker(identity).run_claimed(job_id).await?;
    Ok(Exit::Success)
}

fn reraise(signal: Signal) -> ExitCode {
    use nix::sys::signal::raise;

    if restore_default_disposition(&[signal]).is_ok() {
        let _ = raise(signal);
    }
    ExitCode::from(128u8.saturating_add(signal as u8))
}
