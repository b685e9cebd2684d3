//! Retry and error classification utilities for destination calls
//!
//! Provides exponential backoff and the RPC error classifier used to map
//! node error strings onto the relay error taxonomy.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::RelayError;

/// Backoff configuration for retried operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first try
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies node errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Transaction underpriced - retry with higher gas
    Underpriced,
    /// Nonce too low - the account nonce was already used
    NonceTooLow,
    /// Nonce too high - wait for pending transactions
    NonceTooHigh,
    /// Relayer account cannot pay for gas
    InsufficientFunds,
    /// Permanent failure - do not retry (revert, invalid signature)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("nonce too low") || error_lower.contains("already been processed") {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooHigh;
    }

    if error_lower.contains("insufficient funds") {
        return ErrorClass::InsufficientFunds;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("wrong signature")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("already processed")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Run `operation`, retrying transient failures with exponential backoff.
/// Other errors and the last transient error are returned as is.
pub async fn with_retry<F, T, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable_now() && config.should_retry(attempt) => {
                let backoff = config.backoff_for_attempt(attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max = config.max_retries,
                    ?backoff,
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
