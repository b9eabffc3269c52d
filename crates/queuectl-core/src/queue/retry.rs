//! Retry policy: decides backoff delays.

use std::time::Duration;

use crate::config::QueueConfig;

/// Exponential, unjittered backoff.
///
/// `delay = base_delay_ms * multiplier^(attempts - 1)`
///
/// Deterministic for a given `(attempts, base_delay_ms, multiplier)`, so
/// schedules can be asserted exactly in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay_ms: u64,

    /// Growth factor per additional attempt.
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, multiplier: u32) -> Self {
        Self {
            base_delay_ms,
            multiplier,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.backoff_base_ms, config.backoff_multiplier)
    }

    /// Delay before the job becomes eligible again.
    ///
    /// `attempts` is 1-indexed (the attempt that just failed). Attempt 0 is
    /// treated like attempt 1. Saturates instead of overflowing.
    ///
    /// base=1000ms, multiplier=2:
    /// - attempt 1: 1000ms
    /// - attempt 2: 2000ms
    /// - attempt 3: 4000ms
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_matches_config_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.multiplier, 2);
    }

    #[rstest]
    #[case(1, 1000)]
    #[case(2, 2000)]
    #[case(3, 4000)]
    #[case(4, 8000)]
    fn exponential_backoff_is_deterministic(#[case] attempts: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::new(1000, 2);
        assert_eq!(policy.next_delay(attempts), Duration::from_millis(expected_ms));
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        let policy = RetryPolicy::new(250, 3);
        assert_eq!(policy.next_delay(0), Duration::from_millis(250));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::new(1000, 2);
        assert_eq!(policy.next_delay(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn multiplier_one_is_constant_backoff() {
        let policy = RetryPolicy::new(500, 1);
        assert_eq!(policy.next_delay(1), policy.next_delay(7));
    }
}
