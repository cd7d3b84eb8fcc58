//! Event aggregation
//!
//! Filtering (schema version, repository allow-list, time window) runs before
//! any statistic, so every figure in a summary describes the same event set.

use super::repository::{repository_stats, summarize};
use super::stats::{breakdown, mean, outlier_cutoff};
use crate::model::{
    AggregatedAnalytics, AnalyticsEvent, CacheOperation, FailureCategory, MetricBreakdowns,
    PeriodGranularity,
};
use crate::observability::{LogFields, Logger};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Timelike, TimeZone, Utc};
use std::collections::BTreeMap;
use std::time::Instant;

/// Aggregation options
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOptions {
    pub period: PeriodGranularity,
    /// Inclusive lower bound on event timestamps
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on event timestamps
    pub end: Option<DateTime<Utc>>,
    /// Only events whose repository `full_name` is listed
    pub repositories: Option<Vec<String>>,
    pub include_breakdowns: bool,
    /// Breakdown groups with fewer samples are omitted
    pub min_sample_size: usize,
    pub exclude_outliers: bool,
    /// Percentile (0 - 100) above which duration samples are dropped
    pub outlier_threshold: f64,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        AggregationOptions {
            period: PeriodGranularity::Day,
            start: None,
            end: None,
            repositories: None,
            include_breakdowns: false,
            min_sample_size: 1,
            exclude_outliers: false,
            outlier_threshold: 95.0,
        }
    }
}

impl AggregationOptions {
    /// Options covering the aligned window of `granularity` around `instant`
    pub fn for_period(granularity: PeriodGranularity, instant: DateTime<Utc>) -> Self {
        let (start, end) = period_bounds(granularity, instant);
        AggregationOptions {
            period: granularity,
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    pub fn with_breakdowns(mut self, min_sample_size: usize) -> Self {
        self.include_breakdowns = true;
        self.min_sample_size = min_sample_size;
        self
    }

    pub fn with_repositories(mut self, repositories: Vec<String>) -> Self {
        self.repositories = Some(repositories);
        self
    }

    pub fn excluding_outliers(mut self, threshold: f64) -> Self {
        self.exclude_outliers = true;
        self.outlier_threshold = threshold;
        self
    }
}

/// Aligned UTC window containing `instant`; both ends inclusive
pub fn period_bounds(
    granularity: PeriodGranularity,
    instant: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = instant.date_naive();
    let midnight = date.and_time(NaiveTime::MIN);

    let (start, next) = match granularity {
        PeriodGranularity::Hour => {
            let start = midnight + Duration::hours(i64::from(instant.hour()));
            (start, start + Duration::hours(1))
        }
        PeriodGranularity::Day => (midnight, midnight + Duration::days(1)),
        PeriodGranularity::Week => {
            let back = i64::from(date.weekday().num_days_from_monday());
            let start = midnight - Duration::days(back);
            (start, start + Duration::weeks(1))
        }
        PeriodGranularity::Month => {
            let first = date - Duration::days(i64::from(date.day0()));
            let next = first
                .checked_add_months(Months::new(1))
                .unwrap_or(NaiveDate::MAX);
            (first.and_time(NaiveTime::MIN), next.and_time(NaiveTime::MIN))
        }
    };

    (
        Utc.from_utc_datetime(&start),
        Utc.from_utc_datetime(&next) - Duration::nanoseconds(1),
    )
}

/// Reduces events into period summaries
#[derive(Debug, Clone)]
pub struct Aggregator {
    logger: Logger,
}

impl Aggregator {
    pub fn new(logger: Logger) -> Self {
        Aggregator { logger }
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Events that pass every filter in `options`
    pub fn filter<'e>(
        &self,
        events: &'e [AnalyticsEvent],
        options: &AggregationOptions,
    ) -> Vec<&'e AnalyticsEvent> {
        events
            .iter()
            .filter(|e| e.has_current_schema())
            .filter(|e| match &options.repositories {
                Some(allowed) => allowed.iter().any(|r| *r == e.repository.full_name),
                None => true,
            })
            .filter(|e| options.start.map_or(true, |start| e.timestamp >= start))
            .filter(|e| options.end.map_or(true, |end| e.timestamp <= end))
            .collect()
    }

    pub fn aggregate(
        &self,
        events: &[AnalyticsEvent],
        options: &AggregationOptions,
    ) -> AggregatedAnalytics {
        let started = Instant::now();
        let selected = self.filter(events, options);
        let stale = events.iter().filter(|e| !e.has_current_schema()).count();
        if stale > 0 {
            self.logger.warn(
                "aggregate",
                "events with a different schema version skipped",
                LogFields::new().with("skipped", stale),
            );
        }
        let (period_start, period_end) = self.bounds(&selected, options);

        let mut summary = AggregatedAnalytics::empty(options.period, period_start, period_end);
        if selected.is_empty() {
            self.logger.debug(
                "aggregate",
                "no events after filtering",
                LogFields::new().with("input", events.len()),
            );
            return summary;
        }

        let threshold = self.outlier_threshold(options);

        // Duration samples per group
        let mut cache: Vec<(CacheOperation, f64)> = Vec::new();
        let mut docker: Vec<f64> = Vec::new();
        let mut api: Vec<f64> = Vec::new();
        let mut run: Vec<f64> = Vec::new();
        let mut successes = 0u64;
        let mut failure_counts = FailureCategory::zeroed_tally();

        for event in &selected {
            summary.event_count += 1;
            if event.success {
                successes += 1;
            }
            run.push(event.run_duration_ms);

            for metric in &event.cache_metrics {
                summary.cache_operation_count += 1;
                if metric.operation == CacheOperation::Restore {
                    summary.cache_restore_attempts += 1;
                    if metric.hit {
                        summary.cache_restore_hits += 1;
                    }
                }
                cache.push((metric.operation, metric.duration_ms));
            }
            for metric in &event.docker_metrics {
                summary.docker_operation_count += 1;
                docker.push(metric.duration_ms);
            }
            for metric in &event.api_metrics {
                summary.api_call_count += 1;
                api.push(metric.duration_ms);
            }
            for failure in &event.failures {
                *failure_counts.entry(failure.category).or_insert(0) += 1;
                summary.total_failures += 1;
            }
        }

        if let Some(threshold) = threshold {
            let cache_durations: Vec<f64> = cache.iter().map(|(_, d)| *d).collect();
            if let Some(cutoff) = outlier_cutoff(&cache_durations, threshold) {
                cache.retain(|(_, d)| *d <= cutoff);
            }
            drop_outliers(&mut docker, threshold);
            drop_outliers(&mut api, threshold);
            drop_outliers(&mut run, threshold);
        }
        let cache_durations: Vec<f64> = cache.iter().map(|(_, d)| *d).collect();

        summary.success_rate = percentage(successes, summary.event_count);
        summary.cache_hit_rate =
            percentage(summary.cache_restore_hits, summary.cache_restore_attempts);
        summary.avg_cache_duration_ms = mean(&finite(&cache_durations));
        summary.avg_docker_duration_ms = mean(&finite(&docker));
        summary.avg_api_duration_ms = mean(&finite(&api));
        summary.avg_run_duration_ms = mean(&finite(&run));
        summary.failure_counts = failure_counts;
        summary.repository_stats =
            repository_stats(selected.iter().map(|e| summarize(&e.repository)));

        if options.include_breakdowns {
            let min = options.min_sample_size.max(1);
            let group = |samples: &[f64]| {
                if samples.len() >= min {
                    breakdown(samples)
                } else {
                    None
                }
            };

            let mut by_operation: BTreeMap<CacheOperation, Vec<f64>> = BTreeMap::new();
            for (operation, duration) in &cache {
                by_operation.entry(*operation).or_default().push(*duration);
            }

            summary.breakdowns = Some(MetricBreakdowns {
                cache_duration: group(&cache_durations),
                docker_duration: group(&docker),
                api_duration: group(&api),
                run_duration: group(&run),
                cache_by_operation: by_operation
                    .into_iter()
                    .filter_map(|(op, samples)| group(&samples).map(|b| (op, b)))
                    .collect(),
            });
        }

        self.logger.info(
            "aggregate",
            "summary computed",
            LogFields::new()
                .with("input", events.len())
                .with("selected", summary.event_count)
                .with("elapsed_us", started.elapsed().as_micros()),
        );
        summary
    }

    fn bounds(
        &self,
        selected: &[&AnalyticsEvent],
        options: &AggregationOptions,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let first = selected.iter().map(|e| e.timestamp).min();
        let last = selected.iter().map(|e| e.timestamp).max();
        let now = Utc::now();

        let start = options.start.or(first).unwrap_or(now);
        let end = options.end.or(last).unwrap_or(now);
        if start > end {
            self.logger.warn(
                "aggregate",
                "period start after end; swapping",
                LogFields::new().with("start", start).with("end", end),
            );
            (end, start)
        } else {
            (start, end)
        }
    }

    /// Effective outlier threshold, clamped to [0, 100]
    fn outlier_threshold(&self, options: &AggregationOptions) -> Option<f64> {
        if !options.exclude_outliers {
            return None;
        }
        let raw = options.outlier_threshold;
        let clamped = if raw.is_nan() { 100.0 } else { raw.clamp(0.0, 100.0) };
        if clamped != raw {
            self.logger.warn(
                "aggregate",
                "outlier threshold clamped",
                LogFields::new().with("requested", raw).with("used", clamped),
            );
        }
        Some(clamped)
    }
}

fn drop_outliers(samples: &mut Vec<f64>, threshold: f64) {
    if let Some(cutoff) = outlier_cutoff(samples, threshold) {
        samples.retain(|d| *d <= cutoff);
    }
}

fn finite(samples: &[f64]) -> Vec<f64> {
    samples.iter().copied().filter(|x| x.is_finite()).collect()
}

/// `part / whole` as a percentage; 0 when `whole` is 0
pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
