//! Bounded retry with a fixed backoff
//!
//! The executor knows nothing about HTTP or SQL. Each failure is classified by the
//! caller through [`IsRetryable`]; transient failures are retried after a fixed delay
//! until the attempt limit is exceeded, anything else ends the loop immediately.
//!
//! # Example
//!
//! ```no_run
//! use sql_extractor::retry::{IsRetryable, with_retry};
//! use sql_extractor::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let result = with_retry(&config, |_attempt| async {
//!     Ok::<_, MyError>(())
//! }).await;
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use std::future::Future;

/// Trait for errors that can be classified as retryable or not
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Only connection-level failures; a response of any kind is final
            Error::Network(e) => e.is_connect(),
            _ => false,
        }
    }
}

/// Failure returned by [`with_retry`]
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    #[error("exceeded retry limit after {attempts} attempts: {last}")]
    LimitExceeded {
        /// Number of times the operation was invoked
        attempts: u32,
        /// Error of the final attempt
        last: E,
    },

    /// The operation failed with a non-retryable error
    #[error("{0}")]
    Failed(E),
}

impl From<RetryError<Error>> for Error {
    fn from(err: RetryError<Error>) -> Self {
        match err {
            RetryError::LimitExceeded { attempts, last } => Error::RetryLimitExceeded {
                attempts,
                last: last.to_string(),
            },
            RetryError::Failed(e) => e,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or exceeds the retry limit
///
/// The operation receives the zero-based attempt number. It is invoked at most
/// `config.max_attempts + 1` times (the initial attempt plus `max_attempts` retries),
/// waiting `config.delay` before each retry.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt > config.max_attempts {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                    return Err(RetryError::LimitExceeded {
                        attempts: attempt,
                        last: e,
                    });
                }

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = config.delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(config.delay).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Operation failed with non-retryable error");
                return Err(RetryError::Failed(e));
            }
        }
    }
}
