//! Combining independently computed summaries

use super::repository::repository_stats;
use super::{AggregationError, Aggregator};
use crate::model::{AggregatedAnalytics, RepositorySummary, SCHEMA_VERSION};
use crate::observability::LogFields;

impl Aggregator {
    /// Merge summaries into one.
    ///
    /// Counts are summed; rates and averages are event-count-weighted means;
    /// the period spans every input. Breakdowns cannot be combined from
    /// summary figures alone and are dropped.
    pub fn merge(
        &self,
        summaries: &[AggregatedAnalytics],
    ) -> Result<AggregatedAnalytics, AggregationError> {
        let (first, rest) = summaries.split_first().ok_or(AggregationError::EmptyMerge)?;
        if rest.is_empty() {
            return Ok(first.clone());
        }

        let period_start = summaries
            .iter()
            .map(|s| s.period_start)
            .min()
            .unwrap_or(first.period_start);
        let period_end = summaries
            .iter()
            .map(|s| s.period_end)
            .max()
            .unwrap_or(first.period_end);

        let mut merged = AggregatedAnalytics::empty(first.period, period_start, period_end);
        for s in summaries {
            merged.event_count += s.event_count;
            merged.cache_restore_attempts += s.cache_restore_attempts;
            merged.cache_restore_hits += s.cache_restore_hits;
            merged.cache_operation_count += s.cache_operation_count;
            merged.docker_operation_count += s.docker_operation_count;
            merged.api_call_count += s.api_call_count;
            merged.total_failures += s.total_failures;
            for (category, count) in &s.failure_counts {
                *merged.failure_counts.entry(*category).or_insert(0) += count;
            }
        }

        let weighted = |field: fn(&AggregatedAnalytics) -> f64| {
            weighted_mean(summaries.iter().map(|s| (field(s), s.event_count)))
        };
        merged.success_rate = weighted(|s: &AggregatedAnalytics| s.success_rate);
        merged.cache_hit_rate = weighted(|s: &AggregatedAnalytics| s.cache_hit_rate);
        merged.avg_cache_duration_ms = weighted(|s: &AggregatedAnalytics| s.avg_cache_duration_ms);
        merged.avg_docker_duration_ms = weighted(|s: &AggregatedAnalytics| s.avg_docker_duration_ms);
        merged.avg_api_duration_ms = weighted(|s: &AggregatedAnalytics| s.avg_api_duration_ms);
        merged.avg_run_duration_ms = weighted(|s: &AggregatedAnalytics| s.avg_run_duration_ms);

        // Later periods overwrite earlier entries for the same repository
        let mut ordered: Vec<&AggregatedAnalytics> = summaries.iter().collect();
        ordered.sort_by_key(|s| s.period_end);
        let repositories: Vec<RepositorySummary> = ordered
            .into_iter()
            .flat_map(|s| s.repository_stats.repositories.iter().cloned())
            .collect();
        merged.repository_stats = repository_stats(repositories);
        merged.schema_version = SCHEMA_VERSION.to_string();

        self.logger().debug(
            "merge",
            "summaries merged",
            LogFields::new()
                .with("inputs", summaries.len())
                .with("events", merged.event_count),
        );
        Ok(merged)
    }
}

/// Mean of values weighted by count; 0 when the total weight is 0
fn weighted_mean<I>(values: I) -> f64
where
    I: IntoIterator<Item = (f64, u64)>,
{
    let (sum, weight) = values
        .into_iter()
        .filter(|(v, _)| v.is_finite())
        .fold((0.0, 0u64), |(sum, weight), (v, w)| {
            (sum + v * w as f64, weight + w)
        });
    if weight == 0 {
        0.0
    } else {
        sum / weight as f64
    }
}
