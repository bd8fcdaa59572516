pub mod registry;

pub use registry::{DecodedJob, JobRegistry};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::{JobError, JobRecord};

/// An invocable unit of work rebuilt from a job payload.
///
/// Only `perform` is required. Every lifecycle hook defaults to a no-op, so a
/// job opts into `before`/`success`/`error`/`after`/`failure` by overriding it.
/// The worker calls them in this order:
///
/// `before` -> `perform` -> `success` on success, or `error` on failure -> `after`.
/// `after` always runs. `failure` runs once, when attempts are exhausted.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Run the job
    async fn perform(&self) -> Result<(), JobError>;

    /// Human readable name; defaults to the registered job type
    fn display_name(&self) -> Option<String> {
        None
    }

    async fn before(&self, _job: &JobRecord) -> Result<(), JobError> {
        Ok(())
    }

    async fn success(&self, _job: &JobRecord) -> Result<(), JobError> {
        Ok(())
    }

    async fn error(&self, _job: &JobRecord, _error: &JobError) -> Result<(), JobError> {
        Ok(())
    }

    async fn after(&self, _job: &JobRecord) -> Result<(), JobError> {
        Ok(())
    }

    /// Called when the job fails permanently. Best effort: errors are logged and ignored.
    async fn failure(&self, _job: &JobRecord) -> Result<(), JobError> {
        Ok(())
    }

    /// Override the next run time after a failure; `None` keeps the default backoff
    fn reschedule_at(&self, _now: DateTime<Utc>, _attempts: u32) -> Option<DateTime<Utc>> {
        None
    }
}

/// A job type that can be registered, encoded into a payload and decoded back
pub trait JobType: Job + Serialize + DeserializeOwned {
    /// Job type identifier carried in the payload
    const JOB_TYPE: &'static str;
}
