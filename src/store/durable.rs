//! Durable store
//!
//! Serializes payloads into the cache under date-partitioned keys and reads
//! them back. Transient backend failures are retried with linear backoff;
//! size violations and taken keys fail at once.
//!
//! ## Save path
//!
//! ```text
//! payload -> JSON -> size check -> staging file -> backend.save(key)
//!                                        |
//!                      (retry: attempt * base_delay, until max or deadline)
//! ```

use super::backend::CacheBackend;
use super::clock::{Clock, Timestamp};
use super::retry::{RetryDecision, RetryPolicy};
use super::staging::{default_staging_root, StagingDir};
use crate::config::PipelineConfig;
use crate::model::{
    AggregatedAnalytics, AnalyticsEvent, CacheKey, RecordType, StoredPayload,
};
use crate::observability::{LogFields, Logger};
use chrono::{Duration as DateDuration, NaiveDate};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STAGED_FILE: &str = "payload.json";

/// Why a save did not persist
#[derive(Debug, Clone, PartialEq)]
pub enum StoreFailureReason {
    /// Serialized payload exceeds the configured ceiling; never attempted
    PayloadTooLarge { size: usize, max: usize },
    /// Payload could not be serialized
    Serialization(String),
    /// Payload violates its own invariants or does not match the key
    Invalid(String),
    /// Key already holds an entry; entries are never overwritten
    AlreadyExists,
    /// Staging directory or file could not be written
    Staging(String),
    /// Every attempt failed
    Exhausted { last_error: String },
    /// Retrying would pass the caller's deadline
    DeadlineExceeded { last_error: Option<String> },
}

impl std::fmt::Display for StoreFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreFailureReason::PayloadTooLarge { size, max } => {
                write!(f, "payload of {} bytes exceeds limit of {} bytes", size, max)
            }
            StoreFailureReason::Serialization(msg) => write!(f, "serialization failed: {}", msg),
            StoreFailureReason::Invalid(msg) => write!(f, "invalid payload: {}", msg),
            StoreFailureReason::AlreadyExists => write!(f, "key already exists"),
            StoreFailureReason::Staging(msg) => write!(f, "staging failed: {}", msg),
            StoreFailureReason::Exhausted { last_error } => {
                write!(f, "retries exhausted: {}", last_error)
            }
            StoreFailureReason::DeadlineExceeded { last_error } => match last_error {
                Some(e) => write!(f, "deadline exceeded after: {}", e),
                None => write!(f, "deadline exceeded"),
            },
        }
    }
}

/// Typed save failure
#[derive(Debug, Clone, PartialEq)]
pub struct StoreFailure {
    pub key: String,
    pub record_type: RecordType,
    pub attempts: u32,
    pub reason: StoreFailureReason,
}

impl std::fmt::Display for StoreFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "store of {} {} failed after {} attempt(s): {}",
            self.record_type, self.key, self.attempts, self.reason
        )
    }
}

impl std::error::Error for StoreFailure {}

/// Successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub record_type: RecordType,
    pub size_bytes: usize,
    pub attempts: u32,
}

/// Outcome of a retrieve
///
/// A clean miss is `success && !hit`; an operational fault is `!success`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveResult {
    pub success: bool,
    pub hit: bool,
    pub value: Option<StoredPayload>,
    pub key: String,
    pub attempts: u32,
    pub error: Option<String>,
}

impl RetrieveResult {
    fn hit(key: String, value: StoredPayload, attempts: u32) -> Self {
        RetrieveResult {
            success: true,
            hit: true,
            value: Some(value),
            key,
            attempts,
            error: None,
        }
    }

    fn miss(key: String, attempts: u32) -> Self {
        RetrieveResult {
            success: true,
            hit: false,
            value: None,
            key,
            attempts,
            error: None,
        }
    }

    fn fault(key: String, attempts: u32, error: String) -> Self {
        RetrieveResult {
            success: false,
            hit: false,
            value: None,
            key,
            attempts,
            error: Some(error),
        }
    }

    pub fn into_events(self) -> Option<Vec<AnalyticsEvent>> {
        match self.value {
            Some(StoredPayload::Events { events, .. }) => Some(events),
            _ => None,
        }
    }

    pub fn into_summary(self) -> Option<AggregatedAnalytics> {
        match self.value {
            Some(StoredPayload::Aggregated { summary, .. }) => Some(summary),
            _ => None,
        }
    }
}

/// Cache usage figures; the platform does not expose them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub entries: u64,
    pub bytes: u64,
}

pub struct DurableStore<C: Clock> {
    backend: Arc<dyn CacheBackend>,
    clock: C,
    prefix: String,
    max_payload_bytes: usize,
    retention_days: u32,
    retry: RetryPolicy,
    staging_root: PathBuf,
    logger: Logger,
}

impl<C: Clock> DurableStore<C> {
    pub fn new(
        config: &PipelineConfig,
        backend: Arc<dyn CacheBackend>,
        clock: C,
        logger: Logger,
    ) -> Self {
        DurableStore {
            backend,
            clock,
            prefix: config.cache_key_prefix.trim().to_string(),
            max_payload_bytes: config.max_payload_bytes,
            retention_days: config.retention_days,
            retry: RetryPolicy::from_settings(&config.retry),
            staging_root: default_staging_root(),
            logger,
        }
    }

    /// Stage under `root` instead of the system temp directory
    pub fn with_staging_root(mut self, root: PathBuf) -> Self {
        self.staging_root = root;
        self
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Key for `repository` and `record_type`, partitioned by today's date
    pub fn key(&self, repository: &str, record_type: RecordType) -> CacheKey {
        CacheKey::new(&self.prefix, repository, record_type)
    }

    pub fn key_for_date(
        &self,
        repository: &str,
        record_type: RecordType,
        date: NaiveDate,
    ) -> CacheKey {
        self.key(repository, record_type).with_date(date)
    }

    pub async fn store_events(
        &self,
        repository: &str,
        events: Vec<AnalyticsEvent>,
    ) -> Result<StoredRecord, StoreFailure> {
        let key = self.key(repository, RecordType::Events);
        self.save(&key, &StoredPayload::events(events)).await
    }

    pub async fn store_aggregate(
        &self,
        repository: &str,
        summary: AggregatedAnalytics,
    ) -> Result<StoredRecord, StoreFailure> {
        let key = self.key(repository, RecordType::Aggregated);
        self.save(&key, &StoredPayload::aggregated(summary)).await
    }

    pub async fn store_config(
        &self,
        repository: &str,
        config: PipelineConfig,
    ) -> Result<StoredRecord, StoreFailure> {
        let key = self.key(repository, RecordType::Config);
        self.save(&key, &StoredPayload::config(config)).await
    }

    pub async fn save(
        &self,
        key: &CacheKey,
        payload: &StoredPayload,
    ) -> Result<StoredRecord, StoreFailure> {
        self.save_until(key, payload, None).await
    }

    /// Save, retrying transient failures until attempts run out or the next
    /// backoff would pass `deadline`.
    pub async fn save_until(
        &self,
        key: &CacheKey,
        payload: &StoredPayload,
        deadline: Option<Timestamp>,
    ) -> Result<StoredRecord, StoreFailure> {
        let key_str = key.generate(self.clock.today());
        let record_type = payload.record_type();
        let fail = |attempts: u32, reason: StoreFailureReason| {
            let failure = StoreFailure {
                key: key_str.clone(),
                record_type,
                attempts,
                reason,
            };
            self.logger.failure(
                "save",
                &failure,
                LogFields::new().with("key", &failure.key),
            );
            failure
        };

        if key.record_type != record_type {
            return Err(fail(
                0,
                StoreFailureReason::Invalid(format!(
                    "{} payload under {} key",
                    record_type, key.record_type
                )),
            ));
        }
        if let Err(e) = payload.validate() {
            return Err(fail(0, StoreFailureReason::Invalid(e.to_string())));
        }

        let bytes = payload
            .to_json_bytes()
            .map_err(|e| fail(0, StoreFailureReason::Serialization(e.to_string())))?;
        if bytes.len() > self.max_payload_bytes {
            return Err(fail(
                0,
                StoreFailureReason::PayloadTooLarge {
                    size: bytes.len(),
                    max: self.max_payload_bytes,
                },
            ));
        }

        let staging = StagingDir::create(&self.staging_root)
            .await
            .map_err(|e| fail(0, StoreFailureReason::Staging(e.to_string())))?;
        let staged = staging.file(STAGED_FILE);
        tokio::fs::write(&staged, &bytes)
            .await
            .map_err(|e| fail(0, StoreFailureReason::Staging(e.to_string())))?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let error = match self.backend.save(&key_str, &staged).await {
                Ok(()) => {
                    self.logger.info(
                        "save",
                        "payload stored",
                        LogFields::new()
                            .with("key", &key_str)
                            .with("bytes", bytes.len())
                            .with("attempts", attempts),
                    );
                    return Ok(StoredRecord {
                        key: key_str.clone(),
                        record_type,
                        size_bytes: bytes.len(),
                        attempts,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(fail(attempts, StoreFailureReason::AlreadyExists));
                }
                Err(e) => e,
            };

            match self.retry.decide(attempts, self.clock.now(), deadline) {
                RetryDecision::RetryAfter(delay) => {
                    self.logger.warn(
                        "save",
                        "attempt failed; retrying",
                        LogFields::new()
                            .with("key", &key_str)
                            .with("attempt", attempts)
                            .with("delay_ms", delay.as_millis())
                            .with("error", &error),
                    );
                    self.clock.sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return Err(fail(
                        attempts,
                        StoreFailureReason::Exhausted {
                            last_error: error.to_string(),
                        },
                    ));
                }
                RetryDecision::DeadlineExceeded => {
                    return Err(fail(
                        attempts,
                        StoreFailureReason::DeadlineExceeded {
                            last_error: Some(error.to_string()),
                        },
                    ));
                }
            }
        }
    }

    pub async fn retrieve(&self, key: &CacheKey) -> RetrieveResult {
        self.retrieve_until(key, None).await
    }

    /// Retrieve with the same retry discipline as saves. Decoded payloads are
    /// validated; an invalid payload is a fault and is not retried.
    pub async fn retrieve_until(
        &self,
        key: &CacheKey,
        deadline: Option<Timestamp>,
    ) -> RetrieveResult {
        let key_str = key.generate(self.clock.today());
        let fault = |attempts: u32, error: String| {
            self.logger.failure(
                "retrieve",
                &error,
                LogFields::new().with("key", &key_str).with("attempts", attempts),
            );
            RetrieveResult::fault(key_str.clone(), attempts, error)
        };

        let staging = match StagingDir::create(&self.staging_root).await {
            Ok(s) => s,
            Err(e) => return fault(0, format!("staging failed: {}", e)),
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let error = match self.restore_once(&key_str, staging.path()).await {
                Ok(None) => {
                    self.logger.debug(
                        "retrieve",
                        "cache miss",
                        LogFields::new().with("key", &key_str),
                    );
                    return RetrieveResult::miss(key_str.clone(), attempts);
                }
                Ok(Some(bytes)) => {
                    return match StoredPayload::from_json_bytes(&bytes) {
                        Ok(payload) if payload.record_type() == key.record_type => {
                            self.logger.debug(
                                "retrieve",
                                "cache hit",
                                LogFields::new()
                                    .with("key", &key_str)
                                    .with("bytes", bytes.len()),
                            );
                            RetrieveResult::hit(key_str.clone(), payload, attempts)
                        }
                        Ok(payload) => fault(
                            attempts,
                            format!(
                                "expected {} payload, found {}",
                                key.record_type,
                                payload.record_type()
                            ),
                        ),
                        Err(e) => fault(attempts, e.to_string()),
                    };
                }
                Err(e) => e,
            };

            match self.retry.decide(attempts, self.clock.now(), deadline) {
                RetryDecision::RetryAfter(delay) => {
                    self.logger.warn(
                        "retrieve",
                        "attempt failed; retrying",
                        LogFields::new()
                            .with("key", &key_str)
                            .with("attempt", attempts)
                            .with("delay_ms", delay.as_millis())
                            .with("error", &error),
                    );
                    self.clock.sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return fault(attempts, format!("retries exhausted: {}", error));
                }
                RetryDecision::DeadlineExceeded => {
                    return fault(attempts, format!("deadline exceeded after: {}", error));
                }
            }
        }
    }

    async fn restore_once(
        &self,
        key: &str,
        staging_dir: &Path,
    ) -> std::io::Result<Option<Vec<u8>>> {
        match self.backend.restore(key, staging_dir).await? {
            Some(path) => {
                let bytes = tokio::fs::read(&path).await?;
                let _ = tokio::fs::remove_file(&path).await;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Most recent entry within `lookback_days` of today.
    ///
    /// Walks date partitions from today backwards and stops at the first hit
    /// or fault.
    pub async fn retrieve_latest(
        &self,
        repository: &str,
        record_type: RecordType,
        lookback_days: u32,
    ) -> RetrieveResult {
        let today = self.clock.today();
        let mut last = None;
        for days_back in 0..=lookback_days {
            let date = today - DateDuration::days(i64::from(days_back));
            let result = self
                .retrieve(&self.key_for_date(repository, record_type, date))
                .await;
            if result.hit || !result.success {
                return result;
            }
            last = Some(result);
        }
        match last {
            Some(result) => result,
            None => RetrieveResult::miss(
                self.key(repository, record_type).generate(today),
                0,
            ),
        }
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        let key_str = key.generate(self.clock.today());
        match self.backend.exists(&key_str).await {
            Ok(found) => found,
            Err(e) => {
                self.logger
                    .failure("exists", &e, LogFields::new().with("key", &key_str));
                false
            }
        }
    }

    /// Unsupported by the cache platform; always empty
    pub async fn list(&self, prefix: &str) -> Vec<String> {
        self.logger.warn(
            "list",
            "listing is not supported by the cache backend",
            LogFields::new().with("prefix", prefix),
        );
        Vec::new()
    }

    /// Unsupported by the cache platform; always zero
    pub async fn usage(&self) -> StoreUsage {
        self.logger.warn(
            "usage",
            "usage figures are not available from the cache backend",
            LogFields::new(),
        );
        StoreUsage::default()
    }

    /// Whether the key's date partition is past retention on `today`.
    /// Keys this store cannot parse are never reported as expired.
    pub fn is_expired(&self, key: &str, today: NaiveDate) -> bool {
        CacheKey::parse(key)
            .map(|k| k.is_expired(today, self.retention_days))
            .unwrap_or(false)
    }
}
