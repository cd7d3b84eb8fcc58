//! Descriptive statistics over duration samples

use crate::model::StatisticalBreakdown;

/// Arithmetic mean; 0 for an empty sample
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Sorted copy of the finite samples
pub fn sorted(samples: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
    out.sort_by(f64::total_cmp);
    out
}

/// Nearest-rank percentile of a sorted sample.
///
/// The rank is `ceil(p * n / 100)` clamped to `[1, n]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p * n as f64 / 100.0).ceil();
    let rank = if rank.is_finite() { rank as usize } else { n };
    sorted[rank.clamp(1, n) - 1]
}

/// Median of a sorted sample, interpolated between the middle pair for even
/// counts
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// Population standard deviation
pub fn std_dev(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let m = mean(samples);
    let variance = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}

/// Full breakdown, or `None` when the sample has no finite values
pub fn breakdown(samples: &[f64]) -> Option<StatisticalBreakdown> {
    let sorted = sorted(samples);
    let (min, max) = match (sorted.first(), sorted.last()) {
        (Some(min), Some(max)) => (*min, *max),
        _ => return None,
    };

    Some(StatisticalBreakdown {
        count: sorted.len() as u64,
        sum: sorted.iter().sum(),
        mean: mean(&sorted),
        median: median(&sorted),
        min,
        max,
        std_dev: std_dev(&sorted),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    })
}

/// Largest value kept when excluding outliers above the `threshold`
/// percentile; `None` for an empty sample
pub fn outlier_cutoff(samples: &[f64], threshold: f64) -> Option<f64> {
    let sorted = sorted(samples);
    if sorted.is_empty() {
        None
    } else {
        Some(percentile(&sorted, threshold))
    }
}
