//! Cache key scheme
//!
//! Encodes the repository, record type, schema version and date partition of a
//! stored payload into a deterministic key.
//!
//! Key format: `<prefix>:<repository>:<record_type>:v<schema_version>:<YYYY-MM-DD>`
//!
//! Examples:
//! - `run-telemetry:acme_widgets:events:v1.0.0:2024-03-01`
//! - `run-telemetry:acme_widgets:aggregated:v1.0.0:2024-03-01`

use super::types::SCHEMA_VERSION;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Segment separator within a key
pub const KEY_SEPARATOR: char = ':';

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Kind of record stored under a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Events,
    Aggregated,
    Config,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Events => "events",
            RecordType::Aggregated => "aggregated",
            RecordType::Config => "config",
        }
    }

    pub fn parse(s: &str) -> Option<RecordType> {
        match s {
            "events" => Some(RecordType::Events),
            "aggregated" => Some(RecordType::Aggregated),
            "config" => Some(RecordType::Config),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub prefix: String,
    /// Normalized repository identifier (no path or key separators)
    pub repository: String,
    pub record_type: RecordType,
    pub schema_version: String,
    /// Date partition; the current UTC date is used when absent
    pub date: Option<NaiveDate>,
}

impl CacheKey {
    /// Key for the current schema version without a date partition
    pub fn new(prefix: &str, repository: &str, record_type: RecordType) -> Self {
        CacheKey {
            prefix: prefix.to_string(),
            repository: normalize_repository(repository),
            record_type,
            schema_version: SCHEMA_VERSION.to_string(),
            date: None,
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    /// Copy with the date partition filled in
    pub fn resolved(&self, today: NaiveDate) -> CacheKey {
        let mut key = self.clone();
        key.date = Some(self.date.unwrap_or(today));
        key
    }

    /// Render the key, using `today` when no date partition is set
    pub fn generate(&self, today: NaiveDate) -> String {
        let date = self.date.unwrap_or(today);
        format!(
            "{}{sep}{}{sep}{}{sep}v{}{sep}{}",
            self.prefix,
            self.repository,
            self.record_type.as_str(),
            self.schema_version,
            date.format(DATE_FORMAT),
            sep = KEY_SEPARATOR
        )
    }

    /// Parse a rendered key back into its parts.
    ///
    /// Accepts four segments (no date) or five; anything else is unparseable.
    pub fn parse(key: &str) -> Option<CacheKey> {
        let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        if parts.len() < 4 || parts.len() > 5 {
            return None;
        }
        if parts[0].is_empty() || parts[1].is_empty() {
            return None;
        }

        let record_type = RecordType::parse(parts[2])?;
        let version = parts[3].strip_prefix('v')?;
        if !is_semver(version) {
            return None;
        }
        let date = match parts.get(4) {
            Some(d) => Some(NaiveDate::parse_from_str(d, DATE_FORMAT).ok()?),
            None => None,
        };

        Some(CacheKey {
            prefix: parts[0].to_string(),
            repository: parts[1].to_string(),
            record_type,
            schema_version: version.to_string(),
            date,
        })
    }

    /// Whether the date partition is older than `retention_days` relative to `today`.
    ///
    /// Keys without a date partition never expire.
    pub fn is_expired(&self, today: NaiveDate, retention_days: u32) -> bool {
        match self.date {
            Some(date) => (today - date).num_days() > i64::from(retention_days),
            None => false,
        }
    }
}

/// Segment used when the repository name is blank
pub const UNKNOWN_REPOSITORY: &str = "unknown";

/// Replace path and key separators so a repository name is a single,
/// non-empty segment
pub fn normalize_repository(repository: &str) -> String {
    let trimmed = repository.trim();
    if trimmed.is_empty() {
        return UNKNOWN_REPOSITORY.to_string();
    }
    trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' | KEY_SEPARATOR => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

fn is_semver(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
