//! Simulated Cache with Fault Injection
//!
//! Wraps another backend and injects failures from a seeded RNG, so two
//! runs with the same seed fail at the same points. Scripted failures take
//! precedence over random ones and let tests demand an exact sequence.

use super::backend::{BackendFuture, CacheBackend};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fault probabilities
#[derive(Debug, Clone)]
pub struct SimulatedCacheConfig {
    pub save_fail_prob: f64,
    pub restore_fail_prob: f64,
    pub timeout_prob: f64,
    /// Probability that a restored file has one byte flipped
    pub restore_corrupt_prob: f64,
}

impl Default for SimulatedCacheConfig {
    fn default() -> Self {
        SimulatedCacheConfig {
            save_fail_prob: 0.01,         // 1%
            restore_fail_prob: 0.01,      // 1%
            timeout_prob: 0.005,          // 0.5%
            restore_corrupt_prob: 0.001,  // 0.1%
        }
    }
}

impl SimulatedCacheConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedCacheConfig {
            save_fail_prob: 0.2,
            restore_fail_prob: 0.2,
            timeout_prob: 0.05,
            restore_corrupt_prob: 0.01,
        }
    }

    pub fn no_faults() -> Self {
        SimulatedCacheConfig {
            save_fail_prob: 0.0,
            restore_fail_prob: 0.0,
            timeout_prob: 0.0,
            restore_corrupt_prob: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedCacheStats {
    pub save_attempts: u64,
    pub save_failures: u64,
    pub restore_attempts: u64,
    pub restore_failures: u64,
    pub restore_corruptions: u64,
    pub timeouts: u64,
}

struct SimulatedState {
    rng: ChaCha8Rng,
    stats: SimulatedCacheStats,
    scripted_saves: VecDeque<ErrorKind>,
    scripted_restores: VecDeque<ErrorKind>,
}

impl SimulatedState {
    fn roll(&mut self, prob: f64) -> bool {
        prob > 0.0 && self.rng.gen_bool(prob.min(1.0))
    }
}

/// Fault-injecting wrapper; clones share RNG, stats and scripts
pub struct SimulatedCache<B: CacheBackend> {
    inner: Arc<B>,
    config: SimulatedCacheConfig,
    state: Arc<Mutex<SimulatedState>>,
}

impl<B: CacheBackend> Clone for SimulatedCache<B> {
    fn clone(&self) -> Self {
        SimulatedCache {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<B: CacheBackend> SimulatedCache<B> {
    pub fn new(inner: B, seed: u64, config: SimulatedCacheConfig) -> Self {
        SimulatedCache {
            inner: Arc::new(inner),
            config,
            state: Arc::new(Mutex::new(SimulatedState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedCacheStats::default(),
                scripted_saves: VecDeque::new(),
                scripted_restores: VecDeque::new(),
            })),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn stats(&self) -> SimulatedCacheStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedCacheStats::default();
    }

    /// Fail the next `n` saves with `kind`
    pub fn fail_next_saves(&self, n: usize, kind: ErrorKind) {
        self.state.lock().scripted_saves.extend(std::iter::repeat(kind).take(n));
    }

    /// Fail the next `n` restores with `kind`
    pub fn fail_next_restores(&self, n: usize, kind: ErrorKind) {
        self.state
            .lock()
            .scripted_restores
            .extend(std::iter::repeat(kind).take(n));
    }

    /// Decide the fault, if any, for the next save
    fn save_fault(&self) -> Option<IoError> {
        let mut s = self.state.lock();
        s.stats.save_attempts += 1;

        if let Some(kind) = s.scripted_saves.pop_front() {
            s.stats.save_failures += 1;
            return Some(IoError::new(kind, "scripted save failure"));
        }
        if s.roll(self.config.timeout_prob) {
            s.stats.timeouts += 1;
            return Some(IoError::new(ErrorKind::TimedOut, "simulated timeout"));
        }
        if s.roll(self.config.save_fail_prob) {
            s.stats.save_failures += 1;
            return Some(IoError::new(ErrorKind::Other, "simulated save failure"));
        }
        None
    }

    fn restore_fault(&self) -> Option<IoError> {
        let mut s = self.state.lock();
        s.stats.restore_attempts += 1;

        if let Some(kind) = s.scripted_restores.pop_front() {
            s.stats.restore_failures += 1;
            return Some(IoError::new(kind, "scripted restore failure"));
        }
        if s.roll(self.config.timeout_prob) {
            s.stats.timeouts += 1;
            return Some(IoError::new(ErrorKind::TimedOut, "simulated timeout"));
        }
        if s.roll(self.config.restore_fail_prob) {
            s.stats.restore_failures += 1;
            return Some(IoError::new(ErrorKind::Other, "simulated restore failure"));
        }
        None
    }

    /// Byte offset to flip in a restored file of `len` bytes, if corrupting
    fn corruption(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let mut s = self.state.lock();
        if s.roll(self.config.restore_corrupt_prob) {
            s.stats.restore_corruptions += 1;
            Some(s.rng.gen_range(0..len))
        } else {
            None
        }
    }
}

impl<B: CacheBackend> CacheBackend for SimulatedCache<B> {
    fn save<'a>(&'a self, key: &'a str, staged: &'a Path) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if let Some(e) = self.save_fault() {
                return Err(e);
            }
            self.inner.save(key, staged).await
        })
    }

    fn restore<'a>(
        &'a self,
        key: &'a str,
        staging_dir: &'a Path,
    ) -> BackendFuture<'a, Option<PathBuf>> {
        Box::pin(async move {
            if let Some(e) = self.restore_fault() {
                return Err(e);
            }
            let restored = self.inner.restore(key, staging_dir).await?;
            if let Some(path) = &restored {
                let mut data = tokio::fs::read(path).await?;
                if let Some(idx) = self.corruption(data.len()) {
                    data[idx] ^= 0xFF;
                    tokio::fs::write(path, data).await?;
                }
            }
            Ok(restored)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        self.inner.exists(key)
    }
}
