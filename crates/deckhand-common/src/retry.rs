//! Bounded retry with a fixed back-off interval.
//!
//! Only errors the caller marks as retryable are retried; anything else is
//! returned immediately. Attempts are always bounded.
//!
//! # Example
//!
//! ```ignore
//! use deckhand_common::retry::{retry_with_fixed_backoff, RetryConfig};
//!
//! let out = retry_with_fixed_backoff(
//!     &RetryConfig::new(10, Duration::from_secs(30)),
//!     "channel-readiness",
//!     |e: &ChannelError| e.is_propagation_delay(),
//!     || async { probe().await },
//! ).await?;
//! ```

use std::time::Duration;

use tracing::{error, warn};

/// Configuration for a bounded, fixed-interval retry loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay between attempts
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a config with the given bound and interval
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }
}

/// Outcome of a retry loop that gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The error was not retryable and was returned on the given attempt
    Fatal {
        /// Attempt number (1-based)
        attempt: u32,
        /// The error
        error: E,
    },
    /// Every attempt failed with a retryable error
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// The last error seen
        last: E,
    },
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// attempt bound is hit. Sleeps `config.interval` between attempts.
pub async fn retry_with_fixed_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with a non-retryable error"
                );
                return Err(RetryError::Fatal { attempt, error: e });
            }
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    delay_ms = config.interval.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(config.interval).await;
            }
        }
    }
}
