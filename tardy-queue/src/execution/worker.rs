use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::JobStore,
    config::{FailedJobPolicy, WorkerConfig},
    execution::backoff::next_run_at,
    job::{Job, JobRegistry},
    observability::LiveMetrics,
    reservation::reserve,
    JobError, JobId, JobRecord, QueueResult, WorkerIdentity,
};

/// Result of running one claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job succeeded and its row was deleted
    Completed { runtime: Duration },

    /// The job failed and was scheduled for another attempt
    Rescheduled { attempts: u32, run_at: DateTime<Utc> },

    /// Attempts are exhausted; `retained` when the row was kept with `failed_at`
    PermanentlyFailed { attempts: u32, retained: bool },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Tally returned by [`Worker::work_off`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Runs claimed jobs through their lifecycle.
///
/// Job failures never escape as errors: they become a reschedule or a
/// finalization in the store. Only store errors are returned.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    identity: WorkerIdentity,
    metrics: Arc<LiveMetrics>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        config: WorkerConfig,
        identity: WorkerIdentity,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            identity,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<LiveMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn metrics(&self) -> &Arc<LiveMetrics> {
        &self.metrics
    }

    /// Reserve and run jobs until none is left or `limit` jobs ran
    pub async fn work_off(&self, limit: usize) -> QueueResult<WorkSummary> {
        let mut summary = WorkSummary::default();
        while summary.total() < limit {
            let Some(job) = reserve(self.store.as_ref(), &self.identity, self.config.max_run_time).await? else {
                break;
            };
            if self.run(job).await?.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    /// Run a job previously claimed under this worker's name, looked up by id.
    ///
    /// Returns `None` when the job is gone or its lock now belongs to someone else.
    pub async fn run_claimed(&self, id: JobId) -> QueueResult<Option<Outcome>> {
        let Some(job) = self.store.find(id).await? else {
            warn!(job_id = %id, "claimed job no longer exists");
            return Ok(None);
        };
        if job.locked_by.as_deref() != Some(self.identity.name.as_str()) {
            warn!(job_id = %id, locked_by = ?job.locked_by, "job is not locked by this worker");
            return Ok(None);
        }
        self.run(job).await.map(Some)
    }

    /// Execute one claimed job and record the result in the store
    #[instrument(name = "worker", skip(self, job), fields(worker = %self.identity.name, job_id = %job.id))]
    pub async fn run(&self, job: JobRecord) -> QueueResult<Outcome> {
        let name = job.name(&self.registry);
        let started = Instant::now();

        match job.payload_object(&self.registry) {
            Ok(decoded) => match self.invoke(decoded.job.as_ref(), &job).await {
                Ok(()) => self.complete(job, &name, started.elapsed()).await,
                Err(err) => self.fail(job, &name, Some(decoded.job.as_ref()), err).await,
            },
            Err(err) => self.fail(job, &name, None, JobError::from(err)).await,
        }
    }

    /// Hooks plus `perform`, bounded by `max_run_time` with panics caught
    async fn invoke(&self, job: &dyn Job, record: &JobRecord) -> Result<(), JobError> {
        let max_run_time = self.config.max_run_time;
        let guarded = AssertUnwindSafe(run_hooks(job, record)).catch_unwind();

        match tokio::time::timeout(max_run_time, guarded).await {
            Err(_) => Err(JobError::Expired(max_run_time)),
            Ok(Err(panic)) => Err(JobError::Panicked(panic_message(panic))),
            Ok(Ok(result)) => result,
        }
    }

    async fn complete(&self, job: JobRecord, name: &str, runtime: Duration) -> QueueResult<Outcome> {
        self.store.delete(job.id).await?;
        self.metrics.record_completed(name, runtime);
        info!(job_id = %job.id, "{} completed after {:.4}", name, runtime.as_secs_f64());
        Ok(Outcome::Completed { runtime })
    }

    async fn fail(&self, mut job: JobRecord, name: &str, handler: Option<&dyn Job>, err: JobError) -> QueueResult<Outcome> {
        job.attempts = job.attempts.saturating_add(1);
        job.last_error = Some(err.last_error_text());
        error!(
            job_id = %job.id,
            kind = err.kind(),
            attempts = job.attempts,
            "{} failed with {}: {}",
            name,
            err.kind(),
            err.message()
        );

        let now = self.store.current_time().await?;

        if job.attempts < self.config.max_attempts {
            let attempts = job.attempts;
            job.run_at = handler
                .and_then(|h| h.reschedule_at(now, attempts))
                .unwrap_or_else(|| next_run_at(now, attempts));
            job.unlock();
            self.store.update(&job).await?;
            self.metrics.record_rescheduled(name);
            debug!(job_id = %job.id, run_at = %job.run_at, "rescheduled");
            return Ok(Outcome::Rescheduled { attempts, run_at: job.run_at });
        }

        info!(
            job_id = %job.id,
            "PERMANENTLY removing {} because of {} consecutive failures",
            name,
            job.attempts
        );

        if let Some(handler) = handler {
            match AssertUnwindSafe(handler.failure(&job)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(hook_err)) => warn!(job_id = %job.id, error = %hook_err, "failure hook returned an error"),
                Err(panic) => warn!(job_id = %job.id, panic = %panic_message(panic), "failure hook panicked"),
            }
        }

        let retained = match self.config.failed_job_policy {
            FailedJobPolicy::Destroy => {
                self.store.delete(job.id).await?;
                false
            }
            FailedJobPolicy::Retain => {
                job.unlock();
                self.store.update(&job).await?;
                self.store.mark_failed(job.id, now).await?;
                true
            }
        };
        self.metrics.record_failed(name, retained);

        Ok(Outcome::PermanentlyFailed {
            attempts: job.attempts,
            retained,
        })
    }
}

/// `before`, `perform`, `success`, then `error` on failure, then `after` unconditionally
async fn run_hooks(job: &dyn Job, record: &JobRecord) -> Result<(), JobError> {
    let result = async {
        job.before(record).await?;
        job.perform().await?;
        job.success(record).await
    }
    .await;

    if let Err(err) = &result {
        if let Err(hook_err) = job.error(record, err).await {
            warn!(job_id = %record.id, error = %hook_err, "error hook returned an error");
        }
    }

    match (result, job.after(record).await) {
        (Ok(()), Err(after_err)) => Err(after_err),
        (Err(err), Err(after_err)) => {
            warn!(job_id = %record.id, error = %after_err, "after hook returned an error");
            Err(err)
        }
        (result, Ok(())) => result,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
