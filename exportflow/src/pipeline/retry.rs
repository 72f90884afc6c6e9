//! Retry policy with a fixed backoff table.
//!
//! The delay for retry `n` (1-indexed) is `table[min(n - 1, len - 1)]`, so
//! the last entry repeats once the table runs out.

use crate::config::EngineConfig;
use rand::Rng;
use std::time::Duration;

/// The backoff table used when none is configured.
pub const DEFAULT_BACKOFF_SECONDS: [u64; 5] = [1, 5, 15, 60, 300];

/// Maps attempt numbers to delays and bounds the number of retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    table: Vec<Duration>,
    max_retries: u32,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKOFF_SECONDS.iter().map(|s| Duration::from_secs(*s)).collect(),
            3,
        )
    }
}

impl RetryPolicy {
    /// Creates a policy from a backoff table and retry bound.
    ///
    /// An empty table means retries happen without delay.
    #[must_use]
    pub fn new(table: Vec<Duration>, max_retries: u32) -> Self {
        Self {
            table,
            max_retries,
            jitter: 0.0,
        }
    }

    /// Builds the policy described by an engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.backoff_seconds.iter().map(|s| Duration::from_secs(*s)).collect(),
            config.max_retries,
        )
        .with_jitter(config.backoff_jitter)
    }

    /// A policy that retries immediately. Intended for tests.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(Vec::new(), max_retries)
    }

    /// Sets the jitter ratio, clamped to 0.0-1.0.
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// Sets the retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns the retry bound.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the un-jittered delay before retry `attempt` (1-indexed).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.table.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempt.max(1) as usize - 1).min(self.table.len() - 1);
        self.table[index]
    }

    /// Returns the delay before retry `attempt` (1-indexed), jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Decides what to do after a failed attempt.
    ///
    /// `retry_count` is the number of retries already performed.
    #[must_use]
    pub fn decide(&self, retry_count: u32, max_retries: u32, retryable: bool) -> RetryDecision {
        if !retryable {
            return RetryDecision::NotRetryable;
        }
        if retry_count >= max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for_attempt(retry_count + 1))
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(300));
    }

    #[test]
    fn test_table_saturates_at_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_secs(300));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_table_is_immediate() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.max_retries(), 2);
    }

    #[test]
    fn test_from_config() {
        let config = EngineConfig::new()
            .with_backoff_seconds(vec![2, 4])
            .with_max_retries(7);
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries(), 7);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default().with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_secs_f64(2.5));
            assert!(delay <= Duration::from_secs_f64(7.5));
        }
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(0, 3, true),
            RetryDecision::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(2, 3, true),
            RetryDecision::Retry(Duration::from_secs(15))
        );
        assert_eq!(policy.decide(3, 3, true), RetryDecision::GiveUp);
        assert_eq!(policy.decide(0, 3, false), RetryDecision::NotRetryable);
        assert_eq!(policy.decide(0, 0, true), RetryDecision::GiveUp);
    }
}
