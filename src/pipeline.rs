//! Telemetry pipeline
//!
//! Composition root. Builds the logger handles, sanitizer, aggregator and
//! durable store from one validated `PipelineConfig` and passes them to each
//! other explicitly.
//!
//! ## Record flow
//!
//! 1. Enabled check
//! 2. Sampling (seeded RNG, so tests are reproducible)
//! 3. Per-metric toggles clear disabled metric lists
//! 4. Sanitize; an event that cannot be sanitized is dropped, never stored raw
//! 5. Store the batch under the repository's events key for today
//!
//! Stored entries are immutable, so each repository holds at most one events
//! batch per UTC day. Runs that share a day go through `record_batch`.

use crate::aggregate::{AggregationError, AggregationOptions, Aggregator};
use crate::config::{ConfigError, PipelineConfig};
use crate::model::{AggregatedAnalytics, AnalyticsEvent, RecordType};
use crate::observability::{LogFields, Logger};
use crate::sanitize::Sanitizer;
use crate::store::{CacheBackend, Clock, DurableStore, StoreFailure, StoredRecord};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::sync::Arc;

/// Error type for pipeline operations
#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    Aggregation(AggregationError),
    Store(StoreFailure),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "configuration error: {}", e),
            PipelineError::Aggregation(e) => write!(f, "aggregation error: {}", e),
            PipelineError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(e) => Some(e),
            PipelineError::Aggregation(e) => Some(e),
            PipelineError::Store(e) => Some(e),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}

impl From<AggregationError> for PipelineError {
    fn from(e: AggregationError) -> Self {
        PipelineError::Aggregation(e)
    }
}

impl From<StoreFailure> for PipelineError {
    fn from(e: StoreFailure) -> Self {
        PipelineError::Store(e)
    }
}

/// What happened to recorded events
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Collection is switched off
    Disabled,
    /// Every event was sampled out or dropped
    Skipped { sampled_out: usize, dropped: usize },
    Stored {
        record: StoredRecord,
        events: usize,
        sampled_out: usize,
        dropped: usize,
        /// Sensitive values replaced across the batch
        sanitized_count: usize,
    },
}

impl RecordOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, RecordOutcome::Stored { .. })
    }
}

/// Result of `aggregate_period`
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodReport {
    pub summary: AggregatedAnalytics,
    pub record: StoredRecord,
    /// Dates whose events batch was found
    pub batches_found: usize,
    /// Dates whose retrieval failed; their events are missing from the summary
    pub batches_failed: usize,
}

pub struct TelemetryPipeline<C: Clock> {
    config: PipelineConfig,
    backend: Arc<dyn CacheBackend>,
    clock: C,
    staging_root: Option<PathBuf>,
    logger: Logger,
    sanitizer: Sanitizer,
    aggregator: Aggregator,
    store: DurableStore<C>,
    sampler: Mutex<ChaCha8Rng>,
}

impl<C: Clock> TelemetryPipeline<C> {
    /// Validate `config` and build every component
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn CacheBackend>,
        clock: C,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let logger = Logger::new("pipeline");
        let sanitizer = Sanitizer::from_config(&config, logger.child("sanitizer"));
        let aggregator = Aggregator::new(logger.child("aggregator"));
        let store = DurableStore::new(
            &config,
            Arc::clone(&backend),
            clock.clone(),
            logger.child("store"),
        );

        logger.info(
            "new",
            "pipeline ready",
            LogFields::new()
                .with("enabled", config.enabled)
                .with("sample_rate", config.sample_rate)
                .with("prefix", &config.cache_key_prefix),
        );

        Ok(TelemetryPipeline {
            config,
            backend,
            clock,
            staging_root: None,
            logger,
            sanitizer,
            aggregator,
            store,
            sampler: Mutex::new(ChaCha8Rng::from_entropy()),
        })
    }

    /// Reseed the sampler
    pub fn with_seed(self, seed: u64) -> Self {
        *self.sampler.lock() = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_staging_root(mut self, root: PathBuf) -> Self {
        self.store = self.store.with_staging_root(root.clone());
        self.staging_root = Some(root);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn store(&self) -> &DurableStore<C> {
        &self.store
    }

    pub async fn record_run(&self, event: AnalyticsEvent) -> Result<RecordOutcome, PipelineError> {
        let repository = event.repository.full_name.clone();
        self.record_batch(&repository, vec![event]).await
    }

    /// Record several runs of one repository as a single batch
    pub async fn record_batch(
        &self,
        repository: &str,
        events: Vec<AnalyticsEvent>,
    ) -> Result<RecordOutcome, PipelineError> {
        if !self.config.enabled {
            self.logger.debug(
                "record",
                "collection disabled",
                LogFields::new().with("repository", repository),
            );
            return Ok(RecordOutcome::Disabled);
        }

        let mut kept = Vec::with_capacity(events.len());
        let mut sampled_out = 0usize;
        let mut dropped = 0usize;
        let mut sanitized_count = 0usize;

        for mut event in events {
            if !self.sample() {
                sampled_out += 1;
                continue;
            }
            self.apply_toggles(&mut event);

            match self.sanitizer.sanitize_event(&event) {
                Ok(result) => {
                    sanitized_count += result.sanitized_count;
                    for warning in &result.warnings {
                        self.logger.warn(
                            "record",
                            warning,
                            LogFields::new().with("event", &result.sanitized_value.id),
                        );
                    }
                    kept.push(result.sanitized_value);
                }
                Err(e) => {
                    dropped += 1;
                    self.logger.failure(
                        "record",
                        &e,
                        LogFields::new().with("repository", repository),
                    );
                }
            }
        }

        if kept.is_empty() {
            self.logger.debug(
                "record",
                "nothing to store",
                LogFields::new()
                    .with("repository", repository)
                    .with("sampled_out", sampled_out)
                    .with("dropped", dropped),
            );
            return Ok(RecordOutcome::Skipped {
                sampled_out,
                dropped,
            });
        }

        let count = kept.len();
        let record = self.store.store_events(repository, kept).await?;
        Ok(RecordOutcome::Stored {
            record,
            events: count,
            sampled_out,
            dropped,
            sanitized_count,
        })
    }

    /// Retrieve the events batches for `dates`, aggregate them and store the
    /// summary under today's aggregated key.
    ///
    /// Missing dates are skipped. Dates whose retrieval fails are logged and
    /// counted, and the summary is built from what could be read.
    pub async fn aggregate_period(
        &self,
        repository: &str,
        dates: &[NaiveDate],
        options: &AggregationOptions,
    ) -> Result<PeriodReport, PipelineError> {
        let mut events = Vec::new();
        let mut batches_found = 0usize;
        let mut batches_failed = 0usize;

        for date in dates {
            let key = self
                .store
                .key_for_date(repository, RecordType::Events, *date);
            let result = self.store.retrieve(&key).await;
            if !result.success {
                batches_failed += 1;
                self.logger.warn(
                    "aggregate_period",
                    "events batch unavailable",
                    LogFields::new()
                        .with("key", &result.key)
                        .with("error", result.error.as_deref().unwrap_or("unknown")),
                );
                continue;
            }
            if let Some(batch) = result.into_events() {
                batches_found += 1;
                events.extend(batch);
            }
        }

        let summary = self.aggregator.aggregate(&events, options);
        let record = self
            .store
            .store_aggregate(repository, summary.clone())
            .await?;

        self.logger.info(
            "aggregate_period",
            "period aggregated",
            LogFields::new()
                .with("repository", repository)
                .with("events", summary.event_count)
                .with("batches", batches_found)
                .with("failed", batches_failed),
        );
        Ok(PeriodReport {
            summary,
            record,
            batches_found,
            batches_failed,
        })
    }

    /// Merge `summaries` and store the result under today's aggregated key
    pub async fn merge_and_store(
        &self,
        repository: &str,
        summaries: &[AggregatedAnalytics],
    ) -> Result<(AggregatedAnalytics, StoredRecord), PipelineError> {
        let merged = self.aggregator.merge(summaries)?;
        let record = self
            .store
            .store_aggregate(repository, merged.clone())
            .await?;
        Ok((merged, record))
    }

    /// Rebuild every component from `config`, keeping the backend and clock.
    ///
    /// The sampler is reseeded from entropy; follow with `reseed` for a
    /// reproducible sequence.
    pub fn reset_for_testing(&mut self, config: PipelineConfig) -> Result<(), PipelineError> {
        config.validate()?;
        let mut store = DurableStore::new(
            &config,
            Arc::clone(&self.backend),
            self.clock.clone(),
            self.logger.child("store"),
        );
        if let Some(root) = &self.staging_root {
            store = store.with_staging_root(root.clone());
        }

        self.sanitizer = Sanitizer::from_config(&config, self.logger.child("sanitizer"));
        self.aggregator = Aggregator::new(self.logger.child("aggregator"));
        self.store = store;
        self.config = config;
        *self.sampler.lock() = ChaCha8Rng::from_entropy();
        Ok(())
    }

    pub fn reseed(&self, seed: u64) {
        *self.sampler.lock() = ChaCha8Rng::seed_from_u64(seed);
    }

    fn sample(&self) -> bool {
        let rate = self.config.sample_rate;
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        self.sampler.lock().gen_bool(rate)
    }

    fn apply_toggles(&self, event: &mut AnalyticsEvent) {
        let collect = &self.config.collect;
        if !collect.cache {
            event.cache_metrics.clear();
        }
        if !collect.docker {
            event.docker_metrics.clear();
        }
        if !collect.api {
            event.api_metrics.clear();
        }
        if !collect.failures {
            event.failures.clear();
        }
    }
}
