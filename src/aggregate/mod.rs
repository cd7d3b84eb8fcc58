//! Statistical aggregation of run events

mod aggregator;
mod merge;
mod repository;
pub mod stats;

pub use aggregator::{period_bounds, AggregationOptions, Aggregator};
pub use repository::{repository_stats, summarize};

/// Error type for aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// `merge` was given no summaries
    EmptyMerge,
}

impl std::fmt::Display for AggregationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationError::EmptyMerge => write!(f, "cannot merge an empty set of summaries"),
        }
    }
}

impl std::error::Error for AggregationError {}
