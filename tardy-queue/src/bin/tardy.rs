use std::process::ExitCode;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tardy_queue::prelude::*;
use tracing::info;

/// Logs its message
#[derive(Serialize, Deserialize)]
struct Echo {
    message: String,
}

#[async_trait]
impl Job for Echo {
    async fn perform(&self) -> Result<(), JobError> {
        info!(message = %self.message, "echo");
        Ok(())
    }
}

impl JobType for Echo {
    const JOB_TYPE: &'static str = "echo";
}

/// Sleeps for `secs` seconds
#[derive(Serialize, Deserialize)]
struct Sleep {
    secs: u64,
}

#[async_trait]
impl Job for Sleep {
    async fn perform(&self) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_secs(self.secs)).await;
        Ok(())
    }
}

impl JobType for Sleep {
    const JOB_TYPE: &'static str = "sleep";
}

/// Always fails; exercises backoff and permanent failure
#[derive(Serialize, Deserialize)]
struct Fail {
    reason: String,
}

#[async_trait]
impl Job for Fail {
    async fn perform(&self) -> Result<(), JobError> {
        Err(JobError::new(self.reason.clone()))
    }
}

impl JobType for Fail {
    const JOB_TYPE: &'static str = "fail";
}

fn registry() -> QueueResult<JobRegistry> {
    JobRegistry::new().with::<Echo>()?.with::<Sleep>()?.with::<Fail>()
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    match registry() {
        Ok(registry) => tardy_queue::cli::main_entry(registry),
        Err(e) => {
            eprintln!("tardy: {}", e);
            ExitCode::from(1)
        }
    }
}
