pub mod aggregate;
pub mod config;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod sanitize;
pub mod store;

pub use aggregate::{AggregationError, AggregationOptions, Aggregator};
pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{PeriodReport, PipelineError, RecordOutcome, TelemetryPipeline};
pub use sanitize::{SanitizeResult, Sanitizer};
pub use store::{CacheBackend, Clock, DurableStore, ProductionClock, SimulatedClock};
