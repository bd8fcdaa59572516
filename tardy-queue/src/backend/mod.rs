pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    types::{Eligibility, PriorityRange, QueueFilter},
    JobId, JobRecord, NewJob, QueueError, QueueResult,
};

/// Selection of claimable jobs for one queue preference entry
#[derive(Debug, Clone, Copy)]
pub struct CandidateQuery<'a> {
    pub eligibility: Eligibility<'a>,
    pub queue: &'a QueueFilter,
    pub priority_range: PriorityRange,
    /// Maximum number of candidates returned
    pub limit: usize,
}

impl CandidateQuery<'_> {
    /// Full predicate, for stores that filter in memory
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.eligibility.admits(record)
            && self.queue.matches(record.queue.as_deref())
            && self.priority_range.contains(record.priority)
    }
}

/// Durable job store.
///
/// Claim atomicity is delegated here: `claim` must apply the lock only if the
/// row still satisfies the eligibility predicate at the moment of the write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job; `run_at` defaults to the store's current time
    async fn create(&self, job: NewJob) -> QueueResult<JobRecord>;

    /// Load one job
    async fn find(&self, id: JobId) -> QueueResult<Option<JobRecord>>;

    /// Eligible candidates ordered by `priority` then `run_at`, ascending
    async fn candidates(&self, query: &CandidateQuery<'_>) -> QueueResult<Vec<JobRecord>>;

    /// Conditionally lock one job for `eligibility.worker_name`.
    /// Returns the locked record, or `None` if the row is gone or no longer eligible.
    async fn claim(&self, id: JobId, eligibility: &Eligibility<'_>) -> QueueResult<Option<JobRecord>>;

    /// Persist the mutable columns of a record (attempts, errors, schedule, lock, failure)
    async fn update(&self, record: &JobRecord) -> QueueResult<()>;

    /// Remove a job; returns whether a row was deleted
    async fn delete(&self, id: JobId) -> QueueResult<bool>;

    /// Clear every lock held by `worker_name`; returns the number of rows touched
    async fn clear_locks(&self, worker_name: &str) -> QueueResult<u64>;

    /// Number of stored jobs (failed rows included)
    async fn count(&self) -> QueueResult<u64>;

    /// Remove every job; returns the number of rows deleted
    async fn delete_all(&self) -> QueueResult<u64>;

    /// The store's notion of now
    async fn current_time(&self) -> QueueResult<DateTime<Utc>> {
        Ok(Utc::now())
    }

    /// Mark a job permanently failed, keeping the row
    async fn mark_failed(&self, id: JobId, at: DateTime<Utc>) -> QueueResult<()> {
        let mut record = self
            .find(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        record.failed_at = Some(at);
        record.updated_at = at;
        self.update(&record).await
    }
}
