//! Per-source timeout and retry policy.
//!
//! Retries apply to transient failures only (see
//! [`SourceError::is_retryable`](crate::error::SourceError::is_retryable)).

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 250;
pub const DEFAULT_MAX_DELAY_MS: u64 = 4000;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `initial_ms * 2^n`, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: DEFAULT_INITIAL_DELAY_MS,
            max_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0 = first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 2u64.saturating_pow(retry);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Bound on a single attempt.
    pub timeout: Duration,
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Longest time a fetch under this policy may take: every attempt timing
    /// out plus every backoff sleep in between.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let sleeps = (0..attempts - 1)
            .map(|retry| self.backoff.delay_for_retry(retry))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.timeout.saturating_mul(attempts).saturating_add(sleeps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential { initial_ms: 100, max_ms: 1000 };
        assert_eq!(backoff.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_retry(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_retry(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_retry(63), Duration::from_millis(1000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed { delay_ms: 50 };
        assert_eq!(backoff.delay_for_retry(0), backoff.delay_for_retry(7));
    }

    #[test]
    fn worst_case_sums_timeouts_and_sleeps() {
        let policy = RetryPolicy::new(
            Duration::from_secs(2),
            3,
            Backoff::Exponential { initial_ms: 100, max_ms: 1000 },
        );
        // 3 * 2s + 100ms + 200ms
        assert_eq!(policy.worst_case(), Duration::from_millis(6300));
    }

    #[test]
    fn worst_case_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(
            Duration::from_secs(u64::MAX),
            10,
            Backoff::Fixed { delay_ms: u64::MAX },
        );
        assert_eq!(policy.worst_case(), Duration::MAX);
    }

    #[test]
    fn zero_attempts_means_one() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 0, Backoff::Fixed { delay_ms: 10 });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.worst_case(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_deserializes_from_toml() {
        let fixed: Backoff = toml::from_str("kind = \"fixed\"\ndelay_ms = 500").unwrap();
        assert_eq!(fixed, Backoff::Fixed { delay_ms: 500 });

        let exp: Backoff =
            toml::from_str("kind = \"exponential\"\ninitial_ms = 10\nmax_ms = 80").unwrap();
        assert_eq!(exp, Backoff::Exponential { initial_ms: 10, max_ms: 80 });
    }
}
