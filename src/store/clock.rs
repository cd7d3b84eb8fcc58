//! Clock Abstraction
//!
//! All reads of the current time and every backoff sleep go through this
//! trait, so retry timing and date partitioning are testable without real
//! timers.
//!
//! Implementations:
//! - `ProductionClock`: system time, tokio sleeps
//! - `SimulatedClock`: virtual time that advances only on `advance`, `set`
//!   or `sleep`, and records every sleep

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_millis().max(0) as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0 as i64)
            .single()
            .unwrap_or_default()
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send>>;

pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> Timestamp;

    fn sleep(&self, duration: Duration) -> Sleep;

    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.now().to_datetime()
    }

    /// Current UTC date, used as the default key partition
    fn today(&self) -> NaiveDate {
        self.now_utc().date_naive()
    }
}

/// Production clock using real system time
#[derive(Clone)]
pub struct ProductionClock {
    start: Instant,
    start_millis: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Timestamp(self.start_millis + elapsed)
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests
///
/// `sleep` completes immediately after advancing time by the requested
/// duration. Clones share state.
#[derive(Clone, Default)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn at(dt: DateTime<Utc>) -> Self {
        Self::new(Timestamp::from_datetime(dt).as_millis())
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn current_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }

    /// Every duration passed to `sleep`, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_clock_advances() {
        let clock = ProductionClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();
        assert!(t2.0 - t1.0 >= 10);
    }

    #[test]
    fn test_simulated_clock_deterministic() {
        let clock = SimulatedClock::new(1000);
        assert_eq!(clock.now(), clock.now());

        clock.advance(Duration::from_millis(100));
        assert_eq!(clock.now().0, 1100);

        clock.set(5000);
        assert_eq!(clock.now().0, 5000);
    }

    #[tokio::test]
    async fn test_simulated_sleep_records_and_advances() {
        let clock = SimulatedClock::new(0);
        let shared = clock.clone();

        clock.sleep(Duration::from_millis(250)).await;
        clock.sleep(Duration::from_millis(500)).await;

        assert_eq!(shared.now().0, 750);
        assert_eq!(
            shared.sleeps(),
            vec![Duration::from_millis(250), Duration::from_millis(500)]
        );
    }

    #[test]
    fn test_today_from_virtual_time() {
        let dt = DateTime::parse_from_rfc3339("2024-03-01T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = SimulatedClock::at(dt);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_millis(1000);
        let later = ts + Duration::from_millis(500);
        assert_eq!(later.0, 1500);
        assert_eq!(later.saturating_sub(ts), Duration::from_millis(500));
        assert_eq!(ts.saturating_sub(later), Duration::ZERO);
    }
}
