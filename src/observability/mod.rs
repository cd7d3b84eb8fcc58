//! Structured Logging
//!
//! All components log through an explicitly injected [`Logger`] handle. The
//! process-level subscriber is installed once by the composition root via
//! [`init_logging`].
//!
//! | Field | Description |
//! |-------|-------------|
//! | component | Emitting component (`sanitizer`, `aggregator`, `store`, ...) |
//! | operation | Operation within the component (`sanitize`, `save`, ...) |
//! | details | Rendered `key=value` pairs, never raw payload content |

mod logger;

pub use logger::{condense_error, LogFields, Logger};

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Error returned when the global subscriber cannot be installed
#[derive(Debug)]
pub struct LoggingInitError(String);

impl std::fmt::Display for LoggingInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to initialize logging: {}", self.0)
    }
}

impl std::error::Error for LoggingInitError {}

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set, so operators can
/// raise verbosity for a single run without editing configuration.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.as_directive()))
        .map_err(|e| LoggingInitError(e.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .try_init()
            .map_err(|e| LoggingInitError(e.to_string())),
        LogFormat::Pretty => builder
            .try_init()
            .map_err(|e| LoggingInitError(e.to_string())),
    }
}
