use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attributes for creating a job - immutable submission data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Encoded payload (job type plus arguments)
    pub payload: String,

    /// Target queue, `None` for unqueued
    pub queue: Option<String>,

    /// Job priority, lower runs first
    pub priority: i32,

    /// When the job becomes eligible; defaults to the store's current time
    pub run_at: Option<DateTime<Utc>>,

    /// Pre-seeded attempt count
    pub attempts: u32,

    /// Pre-seeded failure marker
    pub failed_at: Option<DateTime<Utc>>,

    /// Pre-seeded claim marker
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Create a new job submission from an encoded payload
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            queue: None,
            priority: 0,
            run_at: None,
            attempts: 0,
            failed_at: None,
            locked_by: None,
            locked_at: None,
        }
    }

    /// Set the target queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the job priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set when the job should run
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Seed the attempt counter
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Create the job already permanently failed
    pub fn with_failed_at(mut self, failed_at: DateTime<Utc>) -> Self {
        self.failed_at = Some(failed_at);
        self
    }

    /// Create the job already claimed by `worker_name`
    pub fn with_lock(mut self, worker_name: impl Into<String>, locked_at: DateTime<Utc>) -> Self {
        self.locked_by = Some(worker_name.into());
        self.locked_at = Some(locked_at);
        self
    }
}
