use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::JobId;
use crate::{
    job::{DecodedJob, JobRegistry},
    QueueResult,
};

/// Job record - one persisted unit of work with scheduling and lock metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier (store assigned)
    pub id: JobId,

    /// Optional queue tag; `None` means unqueued
    pub queue: Option<String>,

    /// Lower value is served first
    pub priority: i32,

    /// Opaque serialized job reference plus arguments
    pub payload: String,

    /// Number of failed executions so far
    pub attempts: u32,

    /// Last captured failure message and trace
    pub last_error: Option<String>,

    /// The job must not be claimed before this instant
    pub run_at: DateTime<Utc>,

    /// Claim marker timestamp
    pub locked_at: Option<DateTime<Utc>>,

    /// Claim marker owner (worker name)
    pub locked_by: Option<String>,

    /// Set once the job is permanently failed and retained
    pub failed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Instant before which a lock counts as stale, `None` when locks never go stale
pub fn stale_lock_cutoff(now: DateTime<Utc>, max_run_time: Duration) -> Option<DateTime<Utc>> {
    let max_run_time = chrono::Duration::from_std(max_run_time).ok()?;
    now.checked_sub_signed(max_run_time)
}

/// Eligibility of a job for one claimant at one instant.
///
/// A job is eligible iff it is not failed, it is due, and it is either
/// unlocked, locked before the stale cutoff, or locked by the claimant itself.
#[derive(Debug, Clone, Copy)]
pub struct Eligibility<'a> {
    pub now: DateTime<Utc>,
    pub stale_before: Option<DateTime<Utc>>,
    pub worker_name: &'a str,
}

impl<'a> Eligibility<'a> {
    pub fn new(now: DateTime<Utc>, max_run_time: Duration, worker_name: &'a str) -> Self {
        Self {
            now,
            stale_before: stale_lock_cutoff(now, max_run_time),
            worker_name,
        }
    }

    /// Check whether the record may be claimed
    pub fn admits(&self, record: &JobRecord) -> bool {
        if record.failed_at.is_some() || record.run_at > self.now {
            return false;
        }

        match (&record.locked_at, &record.locked_by) {
            (None, _) => true,
            (Some(_), Some(owner)) if owner == self.worker_name => true,
            (Some(locked_at), _) => matches!(self.stale_before, Some(cutoff) if *locked_at < cutoff),
        }
    }
}

impl JobRecord {
    /// Check whether `worker_name` may claim this job at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>, max_run_time: Duration, worker_name: &str) -> bool {
        Eligibility::new(now, max_run_time, worker_name).admits(self)
    }

    /// Check if the job currently carries a claim marker
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Check if the job was permanently failed and retained
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Set the claim marker
    pub fn lock(&mut self, worker_name: &str, now: DateTime<Utc>) {
        self.locked_by = Some(worker_name.to_string());
        self.locked_at = Some(now);
        self.updated_at = now;
    }

    /// Clear the claim marker
    pub fn unlock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }

    /// Rebuild the invocable job from the payload
    pub fn payload_object(&self, registry: &JobRegistry) -> QueueResult<DecodedJob> {
        registry.decode(&self.payload)
    }

    /// Display name of the job, derived from the payload even when it cannot be decoded
    pub fn name(&self, registry: &JobRegistry) -> String {
        match self.payload_object(registry) {
            Ok(decoded) => decoded.name(),
            Err(_) => crate::codec::sniff_job_type(&self.payload).unwrap_or_else(|| "unknown".to_string()),
        }
    }
}
