//! Persisted payload envelope
//!
//! Every stored document is a tagged envelope. The producer declares the
//! `kind`, so validation is a direct match instead of shape sniffing.
//!
//! ```text
//! {"kind":"events","schemaVersion":"1.0.0","events":[...]}
//! {"kind":"aggregated","schemaVersion":"1.0.0","summary":{...}}
//! ```

use super::key::RecordType;
use super::types::{AggregatedAnalytics, AnalyticsEvent, FailureCategory, SCHEMA_VERSION};
use crate::config::PipelineConfig;
use serde::{Deserialize, Serialize};

/// Error type for payload decoding and validation
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadError {
    /// Bytes are not a valid envelope
    Decode(String),
    /// Envelope or contained record uses another schema version
    SchemaMismatch { expected: String, found: String },
    /// Envelope decoded but violates an invariant
    Invalid(String),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Decode(msg) => write!(f, "cannot decode payload: {}", msg),
            PayloadError::SchemaMismatch { expected, found } => {
                write!(f, "schema version mismatch: expected {}, found {}", expected, found)
            }
            PayloadError::Invalid(msg) => write!(f, "invalid payload: {}", msg),
        }
    }
}

impl std::error::Error for PayloadError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredPayload {
    Events {
        #[serde(rename = "schemaVersion")]
        schema_version: String,
        events: Vec<AnalyticsEvent>,
    },
    Aggregated {
        #[serde(rename = "schemaVersion")]
        schema_version: String,
        summary: AggregatedAnalytics,
    },
    Config {
        #[serde(rename = "schemaVersion")]
        schema_version: String,
        config: PipelineConfig,
    },
}

impl StoredPayload {
    pub fn events(events: Vec<AnalyticsEvent>) -> Self {
        StoredPayload::Events {
            schema_version: SCHEMA_VERSION.to_string(),
            events,
        }
    }

    pub fn aggregated(summary: AggregatedAnalytics) -> Self {
        StoredPayload::Aggregated {
            schema_version: SCHEMA_VERSION.to_string(),
            summary,
        }
    }

    pub fn config(config: PipelineConfig) -> Self {
        StoredPayload::Config {
            schema_version: SCHEMA_VERSION.to_string(),
            config,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            StoredPayload::Events { .. } => RecordType::Events,
            StoredPayload::Aggregated { .. } => RecordType::Aggregated,
            StoredPayload::Config { .. } => RecordType::Config,
        }
    }

    pub fn schema_version(&self) -> &str {
        match self {
            StoredPayload::Events { schema_version, .. }
            | StoredPayload::Aggregated { schema_version, .. }
            | StoredPayload::Config { schema_version, .. } => schema_version,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(|e| PayloadError::Decode(e.to_string()))
    }

    /// Decode and validate in one step
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let payload: StoredPayload =
            serde_json::from_slice(bytes).map_err(|e| PayloadError::Decode(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check the envelope version and the invariants of the contained record.
    pub fn validate(&self) -> Result<(), PayloadError> {
        check_version(self.schema_version())?;

        match self {
            StoredPayload::Events { events, .. } => {
                for event in events {
                    check_version(&event.schema_version)?;
                    if event.id.trim().is_empty() {
                        return Err(PayloadError::Invalid("event id is empty".to_string()));
                    }
                    if !is_duration(event.run_duration_ms) {
                        return Err(PayloadError::Invalid(format!(
                            "event {} has invalid run duration",
                            event.id
                        )));
                    }
                }
                Ok(())
            }
            StoredPayload::Aggregated { summary, .. } => {
                check_version(&summary.schema_version)?;
                if summary.period_start > summary.period_end {
                    return Err(PayloadError::Invalid(
                        "period start is after period end".to_string(),
                    ));
                }
                for (name, rate) in [
                    ("success_rate", summary.success_rate),
                    ("cache_hit_rate", summary.cache_hit_rate),
                ] {
                    if !rate.is_finite() || !(0.0..=100.0).contains(&rate) {
                        return Err(PayloadError::Invalid(format!("{} out of range", name)));
                    }
                }
                if FailureCategory::ALL
                    .iter()
                    .any(|c| !summary.failure_counts.contains_key(c))
                {
                    return Err(PayloadError::Invalid(
                        "failure tally is missing a category".to_string(),
                    ));
                }
                Ok(())
            }
            StoredPayload::Config { config, .. } => config
                .validate()
                .map_err(|e| PayloadError::Invalid(e.to_string())),
        }
    }
}

fn check_version(found: &str) -> Result<(), PayloadError> {
    if found == SCHEMA_VERSION {
        Ok(())
    } else {
        Err(PayloadError::SchemaMismatch {
            expected: SCHEMA_VERSION.to_string(),
            found: found.to_string(),
        })
    }
}

fn is_duration(ms: f64) -> bool {
    ms.is_finite() && ms >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{PeriodGranularity, RepositoryInfo, WorkflowContext};
    use chrono::{TimeZone, Utc};

    fn event(id: &str) -> AnalyticsEvent {
        AnalyticsEvent::new(
            id,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            RepositoryInfo::new("acme", "widgets"),
            WorkflowContext::new(7, "renovate"),
        )
    }

    #[test]
    fn test_envelope_tag() {
        let payload = StoredPayload::events(vec![event("a")]);
        let json: serde_json::Value =
            serde_json::from_slice(&payload.to_json_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "events");
        assert_eq!(json["schemaVersion"], SCHEMA_VERSION);
        assert_eq!(json["events"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_decode_validates_event_schema() {
        let mut stale = event("a");
        stale.schema_version = "0.9.0".to_string();
        let bytes = StoredPayload::events(vec![stale]).to_json_bytes().unwrap();

        let err = StoredPayload::from_json_bytes(&bytes).unwrap_err();
        assert_eq!(
            err,
            PayloadError::SchemaMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: "0.9.0".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let err = StoredPayload::from_json_bytes(br#"{"kind":"blob","schemaVersion":"1.0.0"}"#)
            .unwrap_err();
        assert!(matches!(err, PayloadError::Decode(_)));
    }

    #[test]
    fn test_aggregated_period_order_checked() {
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let payload =
            StoredPayload::aggregated(AggregatedAnalytics::empty(PeriodGranularity::Day, start, end));
        assert!(matches!(payload.validate(), Err(PayloadError::Invalid(_))));
    }

    #[test]
    fn test_config_payload_validated() {
        let mut config = PipelineConfig::default();
        config.retention_days = 0;
        assert!(StoredPayload::config(config).validate().is_err());
        assert!(StoredPayload::config(PipelineConfig::default()).validate().is_ok());
    }

    #[test]
    fn test_record_type_dispatch() {
        assert_eq!(StoredPayload::events(vec![]).record_type(), RecordType::Events);
        assert_eq!(
            StoredPayload::config(PipelineConfig::default()).record_type(),
            RecordType::Config
        );
    }
}
