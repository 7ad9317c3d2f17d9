//! Retry policy and exponential backoff with jitter.

use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// How often and how patiently a failed agent invocation is retried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(anyhow!("retry.base_delay_ms must be > 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow!(
                "retry.max_delay_ms ({}) must be >= retry.base_delay_ms ({})",
                self.max_delay_ms,
                self.base_delay_ms
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0 for the first retry).
    ///
    /// `jitter` is a sample from `[0, 1)`; it scales the up-to-50% jitter added
    /// on top of the exponential term. The result is capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(63)));
        let jitter = jitter.clamp(0.0, 1.0);
        let extra = ((exponential / 2) as f64 * jitter) as u64;
        let millis = exponential.saturating_add(extra).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000_000,
        }
    }

    #[test]
    fn delay_stays_within_exponential_bounds() {
        let p = policy();
        for attempt in 0..8u32 {
            let exp = 100u64 * 2u64.pow(attempt);
            for jitter in [0.0, 0.25, 0.5, 0.999_999] {
                let d = p.delay(attempt, jitter).as_millis() as u64;
                assert!(d >= exp, "attempt {attempt}: {d} < {exp}");
                assert!(d <= exp + exp / 2, "attempt {attempt}: {d} > 1.5x");
            }
        }
    }

    #[test]
    fn delay_is_capped_by_max_delay() {
        let p = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        };
        assert_eq!(p.delay(10, 0.9), Duration::from_millis(5_000));
        assert_eq!(p.delay(63, 0.0), Duration::from_millis(5_000));
        assert_eq!(p.delay(u32::MAX, 0.5), Duration::from_millis(5_000));
    }

    #[test]
    fn zero_jitter_is_pure_exponential() {
        let p = policy();
        assert_eq!(p.delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(p.delay(3, 0.0), Duration::from_millis(800));
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let p = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 500,
            max_delay_ms: 100,
        };
        assert!(p.validate().is_err());
        let zero = RetryPolicy {
            base_delay_ms: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
