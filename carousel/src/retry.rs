//! Exponential backoff shared by request submission and webhook delivery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,
    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,
    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows failed attempt number `attempt` (0-based):
    /// `backoff_ms * (backoff_factor ^ attempt)`, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            backoff_ms: 100,
            backoff_factor: 3,
            max_backoff_ms: 1000,
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(300));
        assert_eq!(config.backoff(2), Duration::from_millis(900));
        assert_eq!(config.backoff(3), Duration::from_millis(1000));
        assert_eq!(config.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_allows_retry() {
        let config = RetryConfig::default();
        assert!(config.allows_retry(2));
        assert!(!config.allows_retry(3));
    }
}
