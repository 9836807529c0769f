//! Retry policy - exponential backoff and venue error classification

use std::time::Duration;

use crate::core::config::RetryConfig;
use crate::core::ExchangeError;

/// Retryability of a raw venue error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Classify a venue error once, at the execution layer.
pub fn classify(error: &ExchangeError) -> ErrorClass {
    match error {
        ExchangeError::InsufficientBalance(_)
        | ExchangeError::InvalidParameters(_)
        | ExchangeError::MarketClosed(_)
        | ExchangeError::Rejected(_)
        | ExchangeError::OrderNotFound(_) => ErrorClass::NonRetryable,

        ExchangeError::Network(_)
        | ExchangeError::RateLimited { .. }
        | ExchangeError::Timeout(_) => ErrorClass::Retryable,

        ExchangeError::Server { code, .. } if *code >= 500 => ErrorClass::Retryable,
        ExchangeError::Server { .. } => ErrorClass::NonRetryable,

        ExchangeError::Other(message) => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();

    const FATAL: [&str; 7] = [
        "insufficient",
        "balance",
        "funds",
        "invalid",
        "parameter",
        "suspended",
        "closed",
    ];
    if FATAL.iter().any(|p| msg.contains(p)) || msg.contains("maintenance") {
        return ErrorClass::NonRetryable;
    }

    const TRANSIENT: [&str; 7] = ["timeout", "timed out", "502", "503", "504", "rate", "connection"];
    if TRANSIENT.iter().any(|p| msg.contains(p)) {
        return ErrorClass::Retryable;
    }

    ErrorClass::NonRetryable
}

pub fn is_retryable(error: &ExchangeError) -> bool {
    classify(error) == ErrorClass::Retryable
}

/// Exponential backoff schedule built from [`RetryConfig`].
///
/// delay(attempt) = min(max_delay, initial * factor^attempt), plus up to 25%
/// jitter when enabled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_factor.powi(attempt.min(32) as i32);
        let mut delay_ms = base.min(self.config.max_delay_ms as f64).max(0.0) as u64;

        if self.config.jitter && delay_ms > 0 {
            let jitter = (rand::random::<f64>() * (delay_ms as f64 / 4.0)) as u64;
            delay_ms += jitter;
        }

        Duration::from_millis(delay_ms)
    }

    /// Delay for a specific error; a venue-supplied retry-after wins when longer.
    pub fn delay_after(&self, error: &ExchangeError, attempt: u32) -> Duration {
        let computed = self.delay_for(attempt);
        match error {
            ExchangeError::RateLimited {
                retry_after_ms: Some(ms),
            } => computed.max(Duration::from_millis(*ms)),
            _ => computed,
        }
    }

    /// Whether a failed attempt `attempt` (0-based) should be followed by another.
    pub fn should_retry(&self, error: &ExchangeError, attempt: u32) -> bool {
        attempt < self.config.max_retries && is_retryable(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
