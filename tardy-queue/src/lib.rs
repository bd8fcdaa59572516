//! # tardy-queue: durable background jobs
//!
//! Jobs are rows in a store. Workers claim them with a conditional update, run
//! them through a hook-aware lifecycle and either delete them, push them back
//! with `attempts^4 + 5` seconds of backoff, or finalize them once their
//! attempts run out. A supervisor keeps a pool of isolated execution units
//! busy and answers shutdown and restart requests.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tardy_queue::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendWelcomeMail {
//!     user_id: u64,
//! }
//!
//! #[async_trait]
//! impl Job for SendWelcomeMail {
//!     async fn perform(&self) -> Result<(), JobError> {
//!         // deliver the mail
//!         Ok(())
//!     }
//! }
//!
//! impl JobType for SendWelcomeMail {
//!     const JOB_TYPE: &'static str = "send_welcome_mail";
//! }
//!
//! # async fn demo() -> QueueResult<()> {
//! let registry = JobRegistry::new().with::<SendWelcomeMail>()?;
//! let queue = QueueAdapter::new(MemoryStore::new(), registry);
//!
//! queue
//!     .enqueue_with(&SendWelcomeMail { user_id: 7 }, EnqueueOptions::new().queue("mail"))
//!     .await?;
//! let summary = queue.work_off(100).await?;
//! assert_eq!(summary.succeeded, 1);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod execution;
pub mod job;
pub mod observability;
pub mod reservation;
pub mod supervisor;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod cli;

pub use adapter::{EnqueueOptions, QueueAdapter};
pub use backend::{memory::MemoryStore, CandidateQuery, JobStore};
pub use codec::{json::JsonCodec, JobCodec, PayloadEnvelope};
pub use config::{FailedJobPolicy, Isolation, SupervisorConfig, WorkerConfig};
pub use error::{JobError, QueueError, QueueResult};
pub use execution::{Outcome, WorkSummary, Worker};
pub use job::{Job, JobRegistry, JobType};
pub use observability::LiveMetrics;
pub use reservation::reserve;
pub use supervisor::{Supervisor, SupervisorExit};
pub use types::{JobId, JobRecord, NewJob, PriorityRange, QueueFilter, SlotId, WorkerIdentity};

#[cfg(feature = "sqlite")]
pub use backend::sqlite::SqliteStore;

/// Common imports for defining and enqueueing jobs
pub mod prelude {
    pub use crate::{
        EnqueueOptions, Job, JobError, JobId, JobRecord, JobRegistry, JobStore, JobType, MemoryStore, QueueAdapter,
        QueueError, QueueResult, WorkerConfig, WorkerIdentity,
    };

    pub use async_trait::async_trait;
}
