//! Pipeline Configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment overrides. The merged result must pass [`PipelineConfig::validate`]
//! before any component is built; invalid configuration is a startup failure.
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | RUN_TELEMETRY_ENABLED | true/false |
//! | RUN_TELEMETRY_LOG_LEVEL | error, warn, info, debug, trace |
//! | RUN_TELEMETRY_LOG_FORMAT | pretty or json |
//! | RUN_TELEMETRY_SAMPLE_RATE | 0.0 - 1.0 |
//! | RUN_TELEMETRY_CACHE_KEY_PREFIX | Cache key prefix |
//! | RUN_TELEMETRY_MAX_PAYLOAD_BYTES | Maximum serialized payload size |
//! | RUN_TELEMETRY_RETENTION_DAYS | Days before a stored entry expires |
//! | RUN_TELEMETRY_SENSITIVE_KEYWORDS | Extra field keywords, comma separated |
//! | RUN_TELEMETRY_HASH_SALT | Salt for the hash strategy |

use crate::model::KEY_SEPARATOR;
use crate::sanitize::{SensitiveDataType, Strategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "RUN_TELEMETRY_";

/// Field-name keywords that force sanitization of a string value
pub const DEFAULT_SENSITIVE_KEYWORDS: &[&str] = &[
    "token",
    "password",
    "passwd",
    "secret",
    "key",
    "credential",
    "bearer",
    "authorization",
];

/// Error type for configuration loading and validation
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: PathBuf, source: std::io::Error },
    /// Config file is not valid TOML for this schema
    Parse(String),
    /// Environment variable holds an unparseable value
    InvalidEnv { var: String, value: String },
    /// A setting is out of range
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse(msg) => write!(f, "invalid config file: {}", msg),
            ConfigError::InvalidEnv { var, value } => {
                write!(f, "invalid value {:?} for {}", value, var)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid setting {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn parse(s: &str) -> Option<LogLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
        }
    }
}

/// Per-metric collection switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricToggles {
    pub cache: bool,
    pub docker: bool,
    pub api: bool,
    pub failures: bool,
}

impl Default for MetricToggles {
    fn default() -> Self {
        MetricToggles {
            cache: true,
            docker: true,
            api: true,
            failures: true,
        }
    }
}

/// User-supplied detection pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomPattern {
    pub name: String,
    pub pattern: String,
    #[serde(default = "default_custom_type")]
    pub data_type: SensitiveDataType,
}

fn default_custom_type() -> SensitiveDataType {
    SensitiveDataType::Custom
}

/// Sanitizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SanitizeSettings {
    pub default_strategy: Strategy,
    pub strategy_overrides: BTreeMap<SensitiveDataType, Strategy>,
    /// Characters kept at each end by the partial strategy
    pub partial_mask_length: usize,
    pub mask_char: char,
    pub preserve_structure: bool,
    /// Read from the file or `RUN_TELEMETRY_HASH_SALT`; never written back out
    #[serde(skip_serializing)]
    pub hash_salt: String,
    pub custom_patterns: Vec<CustomPattern>,
}

impl Default for SanitizeSettings {
    fn default() -> Self {
        SanitizeSettings {
            default_strategy: Strategy::Redact,
            strategy_overrides: BTreeMap::new(),
            partial_mask_length: 4,
            mask_char: '*',
            preserve_structure: true,
            hash_salt: String::new(),
            custom_patterns: Vec::new(),
        }
    }
}

/// Store retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub logging: LoggingConfig,
    pub collect: MetricToggles,
    /// Fraction of runs recorded (0.0 - 1.0)
    pub sample_rate: f64,
    pub cache_key_prefix: String,
    pub max_payload_bytes: usize,
    pub retention_days: u32,
    pub sensitive_keywords: Vec<String>,
    pub sanitize: SanitizeSettings,
    pub retry: RetrySettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            enabled: true,
            logging: LoggingConfig::default(),
            collect: MetricToggles::default(),
            sample_rate: 1.0,
            cache_key_prefix: "run-telemetry".to_string(),
            max_payload_bytes: 10 * 1024 * 1024, // 10MB
            retention_days: 30,
            sensitive_keywords: DEFAULT_SENSITIVE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            sanitize: SanitizeSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration for tests (no backoff delay, small payload ceiling)
    pub fn test() -> Self {
        PipelineConfig {
            cache_key_prefix: "test".to_string(),
            max_payload_bytes: 64 * 1024, // 64KB
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 10,
            },
            ..Default::default()
        }
    }

    /// Parse a TOML document over the defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, optional file, process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_from(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RUN_TELEMETRY_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let var = format!("{}{}", ENV_PREFIX, name);
            lookup(&var).map(|value| (var, value))
        };

        if let Some((var, value)) = get("ENABLED") {
            self.enabled = parse_bool(&value).ok_or(ConfigError::InvalidEnv { var, value })?;
        }
        if let Some((var, value)) = get("LOG_LEVEL") {
            self.logging.level =
                LogLevel::parse(&value).ok_or(ConfigError::InvalidEnv { var, value })?;
        }
        if let Some((var, value)) = get("LOG_FORMAT") {
            self.logging.format = match value.trim().to_ascii_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => return Err(ConfigError::InvalidEnv { var, value }),
            };
        }
        if let Some((var, value)) = get("SAMPLE_RATE") {
            self.sample_rate = parse_num(var, value)?;
        }
        if let Some((_, value)) = get("CACHE_KEY_PREFIX") {
            self.cache_key_prefix = value.trim().to_string();
        }
        if let Some((var, value)) = get("MAX_PAYLOAD_BYTES") {
            self.max_payload_bytes = parse_num(var, value)?;
        }
        if let Some((var, value)) = get("RETENTION_DAYS") {
            self.retention_days = parse_num(var, value)?;
        }
        if let Some((_, value)) = get("SENSITIVE_KEYWORDS") {
            for keyword in value.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                let keyword = keyword.to_ascii_lowercase();
                if !self.sensitive_keywords.contains(&keyword) {
                    self.sensitive_keywords.push(keyword);
                }
            }
        }
        if let Some((_, value)) = get("HASH_SALT") {
            self.sanitize.hash_salt = value;
        }
        Ok(())
    }

    /// Check every range constraint; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sample_rate.is_finite() || !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(invalid("sample_rate", format!("{} is outside [0, 1]", self.sample_rate)));
        }
        let prefix = self.cache_key_prefix.trim();
        if prefix.is_empty() {
            return Err(invalid("cache_key_prefix", "must not be empty".to_string()));
        }
        if prefix.contains(KEY_SEPARATOR) || prefix.contains('/') || prefix.contains('\\') {
            return Err(invalid(
                "cache_key_prefix",
                format!("must not contain '{}' or path separators", KEY_SEPARATOR),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(invalid("max_payload_bytes", "must be positive".to_string()));
        }
        if self.retention_days == 0 {
            return Err(invalid("retention_days", "must be positive".to_string()));
        }
        if self.sensitive_keywords.is_empty() {
            return Err(invalid("sensitive_keywords", "must not be empty".to_string()));
        }
        if self.sensitive_keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(invalid("sensitive_keywords", "contains an empty keyword".to_string()));
        }
        if self.sanitize.partial_mask_length == 0 {
            return Err(invalid("sanitize.partial_mask_length", "must be positive".to_string()));
        }
        if self.sanitize.custom_patterns.iter().any(|p| p.name.trim().is_empty()) {
            return Err(invalid("sanitize.custom_patterns", "pattern name must not be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_num<T: std::str::FromStr>(var: String, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
