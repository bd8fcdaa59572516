pub mod metrics;
pub mod tracing;

pub use self::metrics::{GlobalMetrics, JobTypeMetrics, LiveMetrics};
pub use self::tracing::init_tracing;
