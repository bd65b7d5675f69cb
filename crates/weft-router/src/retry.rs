use std::time::Duration;

use weft_core::config::RetryConfig;
use weft_core::error::WeftError;

/// Bounded exponential backoff for transient executor failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// No retries: a single attempt.
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Whether `attempt` (1-based) may be followed by another after `err`.
    pub fn should_retry(&self, err: &WeftError, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.max_attempts()
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        calculate_backoff(retry, &self.config)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn calculate_backoff(retry: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(retry);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    if !config.jitter {
        return Duration::from_millis(ms);
    }
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
