//! Retry discipline for store operations
//!
//! Backoff is linear: the wait after the n-th failed attempt is
//! `n * base_delay`. Decisions are pure so they can be tested without a
//! clock.

use super::clock::Timestamp;
use crate::config::RetrySettings;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
    /// The next attempt would start after the deadline
    DeadlineExceeded,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, settings.base_delay())
    }

    /// Wait after `failed_attempts` failures
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        self.base_delay.saturating_mul(failed_attempts)
    }

    pub fn decide(
        &self,
        failed_attempts: u32,
        now: Timestamp,
        deadline: Option<Timestamp>,
    ) -> RetryDecision {
        if failed_attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self.backoff(failed_attempts);
        match deadline {
            Some(deadline) if now + delay > deadline => RetryDecision::DeadlineExceeded,
            _ => RetryDecision::RetryAfter(delay),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let now = Timestamp(0);
        assert_eq!(
            policy.decide(1, now, None),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            policy.decide(2, now, None),
            RetryDecision::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(policy.decide(3, now, None), RetryDecision::GiveUp);
    }

    #[test]
    fn test_deadline() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let now = Timestamp(1_000);
        assert_eq!(
            policy.decide(1, now, Some(Timestamp(1_100))),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(2, now, Some(Timestamp(1_100))),
            RetryDecision::DeadlineExceeded
        );
    }

    #[test]
    fn test_at_least_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
    }
}
