pub mod backoff;
pub mod worker;

pub use backoff::{backoff_delay, next_run_at};
pub use worker::{Outcome, WorkSummary, Worker};
