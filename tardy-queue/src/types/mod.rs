pub mod ids;
pub mod message;
pub mod record;
pub mod worker;

pub use ids::{JobId, SlotId};
pub use message::NewJob;
pub use record::{Eligibility, JobRecord};
pub use worker::{PriorityRange, QueueFilter, WorkerIdentity};
