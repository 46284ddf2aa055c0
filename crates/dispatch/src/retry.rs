//! Retry backoff policy.
//!
//! Delays are applied as a `next_retry_at` stamp on the requeued job, never
//! as a blocking sleep inside a worker - a slow provider must not pin a
//! concurrency slot while waiting out its own backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `base_delay * 2^(retry_count - 1)`, capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the given retry. `retry_count` is 1-based: the first
    /// retry waits exactly `base_delay`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(30))
            .with_max_delay(Duration::from_secs(3600));

        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
        assert_eq!(policy.backoff(4), Duration::from_secs(240));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(30))
            .with_max_delay(Duration::from_secs(120));

        assert_eq!(policy.backoff(10), Duration::from_secs(120));
        // Huge retry counts must not overflow
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(120));
    }
}
