//! Metric records, cache keys and the persisted payload envelope

mod key;
mod payload;
mod types;

pub use key::{normalize_repository, CacheKey, RecordType, KEY_SEPARATOR};
pub use payload::{PayloadError, StoredPayload};
pub use types::{
    AggregatedAnalytics, AnalyticsEvent, ApiMetric, CacheMetric, CacheOperation, DockerMetric,
    DockerOperation, FailureCategory, FailureMetric, MetricBreakdowns, PeriodGranularity,
    RepositoryInfo, RepositoryStats, RepositorySummary, SizeTier, StatisticalBreakdown,
    WorkflowContext, SCHEMA_VERSION,
};
