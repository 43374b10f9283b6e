//! Retry logic with exponential backoff
//!
//! The transfer core never retries. This module backs the outer
//! [`RetryingTransport`](crate::transport::RetryingTransport) decorator, which
//! applications can wrap around a transport to absorb transient HTTP failures.
//!
//! # Example
//!
//! ```no_run
//! use batch_transfer::retry::{IsRetryable, with_retry};
//! use batch_transfer::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let result = with_retry(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, throttling, server busy) should return `true`.
/// Permanent failures (authentication, bad request, conflicts) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// HTTP statuses worth another attempt
fn is_transient_status(status: Option<u16>) -> bool {
    match status {
        // No response at all: connection reset, timeout, DNS hiccup
        None => true,
        Some(code) => matches!(code, 408 | 429 | 500 | 502 | 503 | 504),
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::TransferFailed { status, .. }
            | Error::PollRequestFailed { status, .. }
            | Error::DownloadFailed { status, .. } => is_transient_status(*status),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            // Token acquisition has its own caching and failure semantics
            Error::AuthFailure { .. } => false,
            Error::PollingTimedOut { .. } => false,
            Error::BatchRejected { .. } => false,
            Error::Cancelled => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, delays, backoff multiplier, jitter)
/// * `operation` - Async closure that returns Result<T, E> where E implements IsRetryable
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    retry_loop(config, None, operation).await
}

/// Like [`with_retry`], but gives up with [`Error::Cancelled`] as soon as `cancel` fires
///
/// Both the attempt in flight and the backoff sleep between attempts are abandoned
/// on cancellation.
pub async fn with_retry_cancellable<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let cancelled: fn() -> Error = || Error::Cancelled;
    retry_loop(config, Some((cancel, cancelled)), operation).await
}

async fn retry_loop<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: Option<(&CancellationToken, fn() -> E)>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        let outcome = match cancel {
            Some((token, cancelled)) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(cancelled()),
                outcome = operation() => outcome,
            },
            None => operation().await,
        };

        match outcome {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                match cancel {
                    Some((token, cancelled)) => tokio::select! {
                        _ = token.cancelled() => {
                            tracing::debug!(attempt, "Retry abandoned, operation cancelled");
                            return Err(cancelled());
                        }
                        _ = tokio::time::sleep(jittered_delay) => {}
                    },
                    None => tokio::time::sleep(jittered_delay).await,
                }

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
