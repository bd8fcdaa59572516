use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{PriorityRange, QueueFilter, SlotId, WorkerIdentity};

/// What happens to a job once its attempts are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailedJobPolicy {
    /// Delete the row
    Destroy,

    /// Keep the row and set `failed_at`
    Retain,
}

/// How the supervisor isolates job executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    /// One OS process per job (re-executes the current binary)
    Process,

    /// One tokio task per job, panics caught at the task boundary
    Task,
}

/// Job lifecycle and reservation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Failed executions allowed before the job is permanently failed
    pub max_attempts: u32,
    /// Execution time limit; also the lock staleness horizon
    pub max_run_time: Duration,
    /// Disposition of permanently failed jobs
    pub failed_job_policy: FailedJobPolicy,
    /// Priority given to jobs enqueued without one
    pub default_priority: i32,
    /// Queue preference list used by workers
    pub queues: Vec<QueueFilter>,
    /// Priority window used by workers
    pub priority_range: PriorityRange,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            max_run_time: Duration::from_secs(4 * 60 * 60),
            failed_job_policy: FailedJobPolicy::Destroy,
            default_priority: 0,
            queues: Vec::new(),
            priority_range: PriorityRange::default(),
        }
    }
}

impl WorkerConfig {
    /// Build from `TARDY_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let destroy = env_parse::<bool>("TARDY_DESTROY_FAILED_JOBS").unwrap_or(true);

        Self {
            max_attempts: env_parse("TARDY_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            max_run_time: env_parse("TARDY_MAX_RUN_TIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_run_time),
            failed_job_policy: if destroy { FailedJobPolicy::Destroy } else { FailedJobPolicy::Retain },
            default_priority: env_parse("TARDY_DEFAULT_PRIORITY").unwrap_or(defaults.default_priority),
            queues: std::env::var("TARDY_QUEUES").map(|v| parse_queue_list(&v)).unwrap_or_default(),
            priority_range: PriorityRange::new(env_parse("TARDY_MIN_PRIORITY"), env_parse("TARDY_MAX_PRIORITY")),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    pub fn with_failed_job_policy(mut self, policy: FailedJobPolicy) -> Self {
        self.failed_job_policy = policy;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueFilter>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_priority_range(mut self, range: PriorityRange) -> Self {
        self.priority_range = range;
        self
    }

    /// Worker identity for a supervisor slot carrying this config's filters
    pub fn identity_for_slot(&self, slot: SlotId) -> WorkerIdentity {
        WorkerIdentity::for_slot(slot)
            .with_queues(self.queues.clone())
            .with_priority_range(self.priority_range)
    }
}

/// Supervisor (pool) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Number of worker slots
    pub workers: usize,
    /// Wait before an idle slot polls again
    pub poll_interval: Duration,
    /// Application root; marker and restart file live under it
    pub root: PathBuf,
    /// Directory holding the pid marker
    pub pid_dir: PathBuf,
    /// Abnormal terminations tolerated inside `crash_window`
    pub crash_threshold: usize,
    pub crash_window: Duration,
    /// Delay applied to a crash-looping slot
    pub crash_delay: Duration,
    /// Watched file; a newer mtime triggers a pool restart
    pub restart_file: Option<PathBuf>,
    /// Wait for units to exit after a shutdown request before killing them
    pub shutdown_grace: Duration,
    pub isolation: Isolation,
    /// Store location used by the CLI
    pub database_url: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::for_root(root)
    }
}

impl SupervisorConfig {
    /// Defaults anchored at `root`
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            workers: 1,
            poll_interval: Duration::from_secs(5),
            pid_dir: root.join("tmp").join("pids"),
            crash_threshold: 4,
            crash_window: Duration::from_secs(60),
            crash_delay: Duration::from_secs(300),
            restart_file: Some(root.join("tmp").join("restart.txt")),
            shutdown_grace: Duration::from_secs(10),
            isolation: Isolation::Process,
            database_url: format!("sqlite://{}?mode=rwc", root.join("tmp").join("tardy.db").display()),
            root,
        }
    }

    /// Build from `TARDY_*` environment variables, falling back to defaults
    pub fn from_env(root: impl Into<PathBuf>) -> Self {
        let defaults = Self::for_root(root);
        Self {
            workers: env_parse("TARDY_WORKERS").unwrap_or(defaults.workers),
            poll_interval: env_parse("TARDY_SLEEP_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            database_url: std::env::var("TARDY_DATABASE_URL").unwrap_or_else(|_| defaults.database_url.clone()),
            ..defaults
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_pid_dir(mut self, pid_dir: impl Into<PathBuf>) -> Self {
        self.pid_dir = pid_dir.into();
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_restart_file(mut self, restart_file: Option<PathBuf>) -> Self {
        self.restart_file = restart_file;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Location of the pid marker
    pub fn pid_file(&self) -> PathBuf {
        self.pid_dir.join("tardy.pid")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Parse a comma separated queue list; `*` is the wildcard
pub fn parse_queue_list(value: &str) -> Vec<QueueFilter> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
