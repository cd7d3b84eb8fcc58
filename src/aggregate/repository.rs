//! Repository de-duplication and bucketing

use crate::model::{RepositoryInfo, RepositoryStats, RepositorySummary, SizeTier};
use std::collections::BTreeMap;

const UNKNOWN_LANGUAGE: &str = "unknown";

pub fn summarize(info: &RepositoryInfo) -> RepositorySummary {
    let language = info
        .language
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(UNKNOWN_LANGUAGE);

    RepositorySummary {
        full_name: info.full_name.clone(),
        language: language.to_string(),
        size_tier: SizeTier::for_size(info.size),
    }
}

/// Stats over repositories seen in order; a later entry for the same
/// `full_name` replaces an earlier one.
pub fn repository_stats<I>(summaries: I) -> RepositoryStats
where
    I: IntoIterator<Item = RepositorySummary>,
{
    let mut unique: BTreeMap<String, RepositorySummary> = BTreeMap::new();
    for summary in summaries {
        unique.insert(summary.full_name.clone(), summary);
    }

    let mut stats = RepositoryStats::default();
    for summary in unique.into_values() {
        stats.total += 1;
        *stats.by_language.entry(summary.language.clone()).or_insert(0) += 1;
        *stats.by_size.entry(summary.size_tier).or_insert(0) += 1;
        stats.repositories.push(summary);
    }
    stats
}
