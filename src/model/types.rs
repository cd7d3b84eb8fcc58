//! Metric record shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version carried by every persisted payload
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Identifying information about the repository a run operated on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub owner: String,
    pub name: String,
    /// `owner/name`; the identity used for de-duplication
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Repository size in KB as reported by the hosting platform
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub private: bool,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl RepositoryInfo {
    pub fn new(owner: &str, name: &str) -> Self {
        RepositoryInfo {
            owner: owner.to_string(),
            name: name.to_string(),
            full_name: format!("{}/{}", owner, name),
            language: None,
            size: 0,
            private: false,
            default_branch: default_branch(),
        }
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Workflow run that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub run_id: u64,
    pub run_number: u64,
    pub workflow: String,
    pub job: String,
    pub event_name: String,
    pub actor: String,
    pub ref_name: String,
    pub sha: String,
}

impl WorkflowContext {
    pub fn new(run_id: u64, workflow: &str) -> Self {
        WorkflowContext {
            run_id,
            run_number: run_id,
            workflow: workflow.to_string(),
            job: "telemetry".to_string(),
            event_name: "schedule".to_string(),
            actor: String::new(),
            ref_name: String::new(),
            sha: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    Restore,
    Save,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOperation::Restore => "restore",
            CacheOperation::Save => "save",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetric {
    pub operation: CacheOperation,
    pub key: String,
    /// Whether a restore found existing data; ignored for saves
    pub hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockerOperation {
    Pull,
    Run,
    Build,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerMetric {
    pub operation: DockerOperation,
    pub image: String,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMetric {
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Closed failure taxonomy used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Authentication,
    Network,
    RateLimit,
    Docker,
    Cache,
    Configuration,
    Timeout,
    Unknown,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 8] = [
        FailureCategory::Authentication,
        FailureCategory::Network,
        FailureCategory::RateLimit,
        FailureCategory::Docker,
        FailureCategory::Cache,
        FailureCategory::Configuration,
        FailureCategory::Timeout,
        FailureCategory::Unknown,
    ];

    /// Tally with every category present at zero
    pub fn zeroed_tally() -> BTreeMap<FailureCategory, u64> {
        Self::ALL.iter().map(|c| (*c, 0)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureMetric {
    pub category: FailureCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Everything collected during one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub id: String,
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    pub repository: RepositoryInfo,
    pub workflow: WorkflowContext,
    pub run_duration_ms: f64,
    pub success: bool,
    #[serde(default)]
    pub cache_metrics: Vec<CacheMetric>,
    #[serde(default)]
    pub docker_metrics: Vec<DockerMetric>,
    #[serde(default)]
    pub api_metrics: Vec<ApiMetric>,
    #[serde(default)]
    pub failures: Vec<FailureMetric>,
}

impl AnalyticsEvent {
    /// Empty event stamped with the current schema version
    pub fn new(
        id: &str,
        timestamp: DateTime<Utc>,
        repository: RepositoryInfo,
        workflow: WorkflowContext,
    ) -> Self {
        AnalyticsEvent {
            id: id.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            timestamp,
            repository,
            workflow,
            run_duration_ms: 0.0,
            success: true,
            cache_metrics: Vec::new(),
            docker_metrics: Vec::new(),
            api_metrics: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn has_current_schema(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }

    /// Set every NaN, infinite or negative duration to 0.
    ///
    /// JSON has no encoding for non-finite numbers, so such a value cannot
    /// survive a round trip. Returns how many durations were reset.
    pub fn zero_invalid_durations(&mut self) -> usize {
        let mut reset = 0;
        let mut fix = |ms: &mut f64| {
            if !ms.is_finite() || *ms < 0.0 {
                *ms = 0.0;
                reset += 1;
            }
        };
        fix(&mut self.run_duration_ms);
        for m in &mut self.cache_metrics {
            fix(&mut m.duration_ms);
        }
        for m in &mut self.docker_metrics {
            fix(&mut m.duration_ms);
        }
        for m in &mut self.api_metrics {
            fix(&mut m.duration_ms);
        }
        reset
    }
}

/// Aggregation window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeriodGranularity {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

/// Repository size bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeTier {
    Small,
    Medium,
    Large,
    Enterprise,
}

impl SizeTier {
    pub fn for_size(size: u64) -> SizeTier {
        match size {
            0..=999 => SizeTier::Small,
            1_000..=9_999 => SizeTier::Medium,
            10_000..=99_999 => SizeTier::Large,
            _ => SizeTier::Enterprise,
        }
    }
}

/// One de-duplicated repository inside a summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySummary {
    pub full_name: String,
    pub language: String,
    pub size_tier: SizeTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub total: u64,
    pub by_language: BTreeMap<String, u64>,
    pub by_size: BTreeMap<SizeTier, u64>,
    /// Sorted by `full_name`
    pub repositories: Vec<RepositorySummary>,
}

/// Descriptive statistics over one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatisticalBreakdown {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricBreakdowns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_duration: Option<StatisticalBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_duration: Option<StatisticalBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_duration: Option<StatisticalBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_duration: Option<StatisticalBreakdown>,
    #[serde(default)]
    pub cache_by_operation: BTreeMap<CacheOperation, StatisticalBreakdown>,
}

/// Statistical summary over a period and event set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedAnalytics {
    pub schema_version: String,
    pub period: PeriodGranularity,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub event_count: u64,
    /// Successful runs as a percentage (0 - 100)
    pub success_rate: f64,
    /// Restore hits as a percentage of restore attempts (0 - 100)
    pub cache_hit_rate: f64,
    pub cache_restore_attempts: u64,
    pub cache_restore_hits: u64,
    pub cache_operation_count: u64,
    pub docker_operation_count: u64,
    pub api_call_count: u64,
    pub avg_cache_duration_ms: f64,
    pub avg_docker_duration_ms: f64,
    pub avg_api_duration_ms: f64,
    pub avg_run_duration_ms: f64,
    pub failure_counts: BTreeMap<FailureCategory, u64>,
    pub total_failures: u64,
    pub repository_stats: RepositoryStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdowns: Option<MetricBreakdowns>,
}

impl AggregatedAnalytics {
    /// Well-formed summary over no events
    pub fn empty(
        period: PeriodGranularity,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        AggregatedAnalytics {
            schema_version: SCHEMA_VERSION.to_string(),
            period,
            period_start,
            period_end,
            event_count: 0,
            success_rate: 0.0,
            cache_hit_rate: 0.0,
            cache_restore_attempts: 0,
            cache_restore_hits: 0,
            cache_operation_count: 0,
            docker_operation_count: 0,
            api_call_count: 0,
            avg_cache_duration_ms: 0.0,
            avg_docker_duration_ms: 0.0,
            avg_api_duration_ms: 0.0,
            avg_run_duration_ms: 0.0,
            failure_counts: FailureCategory::zeroed_tally(),
            total_failures: 0,
            repository_stats: RepositoryStats::default(),
            breakdowns: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_tiers() {
        assert_eq!(SizeTier::for_size(0), SizeTier::Small);
        assert_eq!(SizeTier::for_size(999), SizeTier::Small);
        assert_eq!(SizeTier::for_size(1_000), SizeTier::Medium);
        assert_eq!(SizeTier::for_size(9_999), SizeTier::Medium);
        assert_eq!(SizeTier::for_size(10_000), SizeTier::Large);
        assert_eq!(SizeTier::for_size(99_999), SizeTier::Large);
        assert_eq!(SizeTier::for_size(100_000), SizeTier::Enterprise);
    }

    #[test]
    fn test_zeroed_tally_has_every_category() {
        let tally = FailureCategory::zeroed_tally();
        assert_eq!(tally.len(), FailureCategory::ALL.len());
        assert!(tally.values().all(|v| *v == 0));
    }

    #[test]
    fn test_event_json_shape() {
        let event = AnalyticsEvent::new(
            "evt-1",
            DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap().with_timezone(&Utc),
            RepositoryInfo::new("acme", "widgets"),
            WorkflowContext::new(42, "renovate"),
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["schemaVersion"], SCHEMA_VERSION);
        assert_eq!(json["repository"]["fullName"], "acme/widgets");
        assert_eq!(json["workflow"]["runId"], 42);
        // Absent optionals are omitted rather than null
        assert!(json["repository"].get("language").is_none());
    }

    #[test]
    fn test_failure_category_serializes_snake_case() {
        let json = serde_json::to_string(&FailureCategory::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
    }
}
