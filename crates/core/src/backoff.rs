//! Retry backoff policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// attempt^4 seconds + 15s + up to 30s of jitter per attempt
    Polynomial,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Polynomial
    }
}

/// How far in the future a failed job is scheduled for its next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay (ignored by `Polynomial`)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(30 * 24 * 60 * 60),
            strategy: BackoffStrategy::Polynomial,
            jitter: 1.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `attempt` (1-indexed, i.e. the job's
    /// `retry_count` after the failure was recorded).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        // Deterministic stand-in for randomness, in [0, 1).
        let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * attempt as f64,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi((attempt - 1) as i32),
            BackoffStrategy::Polynomial => {
                let n = attempt as f64;
                let jitter_secs = (30.0 * pseudo_random * self.jitter).round() * (n + 1.0);
                (n.powi(4) + 15.0 + jitter_secs) * 1000.0
            }
        };

        let jitter_ms = match self.strategy {
            // Polynomial carries its own jitter term.
            BackoffStrategy::Polynomial => 0.0,
            _ => delay_ms * self.jitter * (pseudo_random - 0.5) * 2.0,
        };

        Duration::from_millis((delay_ms + jitter_ms).clamp(0.0, max_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn polynomial_without_jitter_is_n4_plus_15() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(31));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(96));
    }

    #[test]
    fn polynomial_default_grows_and_is_capped() {
        let policy = BackoffPolicy::default();

        let mut last = Duration::ZERO;
        for attempt in 1..=25 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_secs(u64::from(attempt).pow(4) + 15));
            assert!(delay <= policy.max_delay);
            if attempt > 3 {
                assert!(delay > last);
            }
            last = delay;
        }
    }

    #[test]
    fn zero_attempt_has_no_delay() {
        assert_eq!(BackoffPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }
}
