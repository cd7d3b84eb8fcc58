//! Durable Store DST Integration Tests
//!
//! Multi-seed runs against a fault-injecting cache with a simulated clock.
//! Same seed, same faults, same outcome.

use chrono::{DateTime, Utc};
use run_telemetry::config::PipelineConfig;
use run_telemetry::model::{AnalyticsEvent, RecordType, RepositoryInfo, StoredPayload, WorkflowContext};
use run_telemetry::observability::Logger;
use run_telemetry::store::{
    Clock, DurableStore, InMemoryCache, LocalFsCache, SimulatedCache, SimulatedCacheConfig,
    SimulatedClock, StoreFailureReason,
};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn event(id: &str) -> AnalyticsEvent {
    AnalyticsEvent::new(
        id,
        at("2024-03-01T10:00:00Z"),
        RepositoryInfo::new("acme", "widgets"),
        WorkflowContext::new(7, "renovate"),
    )
}

fn leftover_staging(root: &Path) -> usize {
    std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
}

fn chaos_store(
    seed: u64,
    staging: &Path,
) -> (
    DurableStore<SimulatedClock>,
    SimulatedCache<InMemoryCache>,
    SimulatedClock,
) {
    let cache = SimulatedCache::new(InMemoryCache::new(), seed, SimulatedCacheConfig::high_chaos());
    let clock = SimulatedClock::at(at("2024-03-01T12:00:00Z"));
    let store = DurableStore::new(
        &PipelineConfig::test(),
        Arc::new(cache.clone()),
        clock.clone(),
        Logger::new("store"),
    )
    .with_staging_root(staging.to_path_buf());
    (store, cache, clock)
}

#[tokio::test]
async fn test_store_dst_50_seeds_high_chaos() {
    // INVARIANT: a save reported as stored is in the cache; a failed save
    // never leaves a partial entry; staging never outlives a call.
    for seed in 0..50u64 {
        let staging = tempfile::tempdir().unwrap();
        let (store, cache, _clock) = chaos_store(seed, staging.path());

        let mut stored = Vec::new();
        for i in 0..10 {
            let repo = format!("acme/repo{}", i);
            match store.store_events(&repo, vec![event(&format!("e{}", i))]).await {
                Ok(record) => {
                    assert!(record.attempts >= 1 && record.attempts <= 3, "seed {}", seed);
                    stored.push(record.key);
                }
                Err(failure) => {
                    assert!(
                        matches!(failure.reason, StoreFailureReason::Exhausted { .. }),
                        "seed {}: unexpected {}",
                        seed,
                        failure
                    );
                    assert!(cache.inner().get(&failure.key).is_none(), "seed {}", seed);
                }
            }
        }

        for key in &stored {
            assert!(cache.inner().get(key).is_some(), "seed {}: {} missing", seed, key);
        }
        assert_eq!(leftover_staging(staging.path()), 0, "seed {}", seed);
    }
}

#[tokio::test]
async fn test_store_dst_same_seed_same_outcome() {
    async fn run(seed: u64) -> Vec<bool> {
        let staging = tempfile::tempdir().unwrap();
        let (store, _cache, _clock) = chaos_store(seed, staging.path());
        let mut outcomes = Vec::new();
        for i in 0..20 {
            let repo = format!("acme/repo{}", i);
            outcomes.push(store.store_events(&repo, vec![event("e")]).await.is_ok());
        }
        outcomes
    }

    assert_eq!(run(99).await, run(99).await);
}

#[tokio::test]
async fn test_retries_sleep_linearly() {
    let staging = tempfile::tempdir().unwrap();
    let cache = SimulatedCache::new(InMemoryCache::new(), 1, SimulatedCacheConfig::no_faults());
    let clock = SimulatedClock::at(at("2024-03-01T12:00:00Z"));
    let mut config = PipelineConfig::test();
    config.retry.base_delay_ms = 1000;
    let store = DurableStore::new(&config, Arc::new(cache.clone()), clock.clone(), Logger::new("store"))
        .with_staging_root(staging.path().to_path_buf());

    cache.fail_next_saves(2, ErrorKind::ConnectionReset);
    let start = clock.now();
    let record = store.store_events("acme/widgets", vec![event("a")]).await.unwrap();

    assert_eq!(record.attempts, 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
    assert_eq!(clock.elapsed(start), Duration::from_millis(3000));
}

#[tokio::test]
async fn test_oversized_save_leaves_nothing_behind() {
    let staging = tempfile::tempdir().unwrap();
    let (store, cache, clock) = chaos_store(3, staging.path());
    let mut big = event("big");
    big.workflow.job = "j".repeat(100 * 1024);

    let failure = store.store_events("acme/widgets", vec![big]).await.unwrap_err();
    assert_eq!(failure.attempts, 0);
    assert!(matches!(failure.reason, StoreFailureReason::PayloadTooLarge { max, .. } if max == 64 * 1024));
    assert_eq!(cache.stats().save_attempts, 0);
    assert!(clock.sleeps().is_empty());
    assert_eq!(leftover_staging(staging.path()), 0);
}

#[tokio::test]
async fn test_unknown_key_is_clean_miss() {
    let staging = tempfile::tempdir().unwrap();
    let cache = InMemoryCache::new();
    let store = DurableStore::new(
        &PipelineConfig::test(),
        Arc::new(cache),
        SimulatedClock::at(at("2024-03-01T12:00:00Z")),
        Logger::new("store"),
    )
    .with_staging_root(staging.path().to_path_buf());

    let result = store.retrieve(&store.key("never/written", RecordType::Events)).await;
    assert!(result.success);
    assert!(!result.hit);
    assert!(result.value.is_none());
}

#[tokio::test]
async fn test_localfs_backend_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let cache = LocalFsCache::new(root.path().join("cache"));
    let store = DurableStore::new(
        &PipelineConfig::test(),
        Arc::new(cache),
        SimulatedClock::at(at("2024-03-01T12:00:00Z")),
        Logger::new("store"),
    )
    .with_staging_root(root.path().join("staging"));

    let key = store.key("acme/widgets", RecordType::Events);
    store
        .save(&key, &StoredPayload::events(vec![event("a"), event("b")]))
        .await
        .unwrap();

    let result = store.retrieve(&key).await;
    assert!(result.hit);
    let events = result.into_events().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].id, "b");
    assert_eq!(leftover_staging(&root.path().join("staging")), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_localfs_concurrent_same_key_never_both_stored() {
    // INVARIANT: of two racing saves to one key, exactly one is stored and
    // the other fails with AlreadyExists.
    for round in 0..50u32 {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(
            DurableStore::new(
                &PipelineConfig::test(),
                Arc::new(LocalFsCache::new(root.path().join("cache"))),
                SimulatedClock::at(at("2024-03-01T12:00:00Z")),
                Logger::new("store"),
            )
            .with_staging_root(root.path().join("staging")),
        );

        let spawn_save = |id: &'static str| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.store_events("acme/widgets", vec![event(id)]).await })
        };
        let (a, b) = (spawn_save("a"), spawn_save("b"));
        let results = [a.await.unwrap(), b.await.unwrap()];

        let stored: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(stored.len(), 1, "round {}", round);
        let failure = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(failure.reason, StoreFailureReason::AlreadyExists, "round {}", round);

        let winner = if results[0].is_ok() { "a" } else { "b" };
        let events = store
            .retrieve(&store.key("acme/widgets", RecordType::Events))
            .await
            .into_events()
            .unwrap();
        assert_eq!(events[0].id, winner, "round {}", round);
        assert_eq!(leftover_staging(&root.path().join("staging")), 0);
    }
}
