use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{QueueError, QueueResult};

/// Install the global subscriber. The filter comes from `RUST_LOG` and defaults to `info`.
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(json: bool) -> QueueResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    result.map_err(|e| QueueError::Config(format!("tracing subscriber: {}", e)))
}
