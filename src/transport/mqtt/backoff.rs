//! Reconnect delay calculation
//!
//! The base delay doubles per attempt from an initial delay up to a cap; a
//! uniform random jitter of up to `jitter_ratio * base` is added so clients
//! recovering from the same broker outage do not retry in lockstep.

use crate::config::ReconnectSection;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with cap and jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.2,
        }
    }
}

impl From<&ReconnectSection> for BackoffPolicy {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            jitter_ratio: section.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        // 2^31 already saturates any realistic cap
        let factor = 1u32 << exponent.min(31);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before reconnect attempt `attempt` (1-based), jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let max_jitter_nanos = (base.as_nanos() as f64 * self.jitter_ratio) as u64;
        if max_jitter_nanos == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=max_jitter_nanos);
        base + Duration::from_nanos(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(5));
        assert_eq!(policy.base_delay(2), Duration::from_secs(10));
        assert_eq!(policy.base_delay(3), Duration::from_secs(20));
        assert_eq!(policy.base_delay(4), Duration::from_secs(40));
        assert_eq!(policy.base_delay(5), Duration::from_secs(60));
        assert_eq!(policy.base_delay(100), Duration::from_secs(60));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(0), policy.base_delay(1));
    }

    #[test]
    fn test_no_jitter() {
        let policy = BackoffPolicy {
            jitter_ratio: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay(3), Duration::from_secs(20));
    }

    #[test]
    fn test_from_reconnect_section() {
        let section = ReconnectSection {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ratio: 0.5,
            connect_grace_ms: 10,
        };
        let policy = BackoffPolicy::from(&section);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
        assert_eq!(policy.jitter_ratio, 0.5);
    }

    proptest! {
        #[test]
        fn prop_delay_within_jitter_bounds(attempt in 1u32..64) {
            let policy = BackoffPolicy::default();
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt);
            prop_assert!(delay >= base);
            prop_assert!(delay - base <= base / 5);
        }

        #[test]
        fn prop_base_delay_non_decreasing(attempt in 1u32..64) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.base_delay(attempt) <= policy.base_delay(attempt + 1));
            prop_assert!(policy.base_delay(attempt) <= policy.max_delay);
        }
    }
}
