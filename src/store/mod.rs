//! Durable storage on top of a file-based remote cache
//!
//! Keys are date partitioned and never overwritten. Time flows through the
//! `Clock` trait so retries can be driven deterministically in tests.

mod backend;
mod clock;
mod durable;
mod retry;
mod simulated;
mod staging;

pub use backend::{BackendFuture, CacheBackend, InMemoryCache, LocalFsCache, RESTORED_FILE};
pub use clock::{Clock, ProductionClock, SimulatedClock, Sleep, Timestamp};
pub use durable::{
    DurableStore, RetrieveResult, StoreFailure, StoreFailureReason, StoreUsage, StoredRecord,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use simulated::{SimulatedCache, SimulatedCacheConfig, SimulatedCacheStats};
pub use staging::{default_staging_root, StagingDir};
