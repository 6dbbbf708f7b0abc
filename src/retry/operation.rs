//! Retry/backoff executor

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::backoff::RetryConfig;
use super::classify::classify;
use crate::context::{CancelReason, Context};

/// Terminal failure of a retried call
///
/// Callers never see intermediate attempts, only one of these.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The failure was classified as not worth retrying; returned as-is
    #[error(transparent)]
    Permanent(E),

    /// Every attempt failed with a retryable error
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    /// The caller's context fired while waiting to retry
    #[error("retry cancelled while waiting ({reason}); last error: {last}")]
    Cancelled {
        #[source]
        reason: CancelReason,
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The last underlying failure
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Permanent(err) => err,
            RetryError::Exhausted { last, .. } => last,
            RetryError::Cancelled { last, .. } => last,
        }
    }

    /// Consumes the wrapper, returning the last underlying failure
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(err) => err,
            RetryError::Exhausted { last, .. } => last,
            RetryError::Cancelled { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Runs `operation` until it succeeds, fails permanently, runs out of
/// retries, or `ctx` fires during a backoff wait
///
/// The delay before each retry is the classifier's `retry_after` hint when it
/// supplies one, otherwise the next step of the backoff schedule.
pub async fn retry_with_backoff<T, E, F, Fut>(
    ctx: &Context,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StdError + 'static,
{
    let mut backoff = config.backoff();
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let verdict = classify(&err);
        if !verdict.retryable {
            debug!(kind = ?verdict.kind, error = %err, "Permanent error, not retrying");
            return Err(RetryError::Permanent(err));
        }
        if attempt >= config.max_retries {
            warn!(attempts = attempt + 1, error = %err, "Retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                last: err,
            });
        }

        let scheduled = backoff.next().unwrap_or(config.max_backoff);
        let delay: Duration = verdict.retry_after.unwrap_or(scheduled);
        warn!(
            attempt = attempt + 1,
            max_retries = config.max_retries,
            kind = ?verdict.kind,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient error, will retry"
        );

        tokio::select! {
            biased;
            reason = ctx.done() => {
                debug!(%reason, "Retry wait cancelled");
                return Err(RetryError::Cancelled { reason, last: err });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

/// A retry configuration bound to an `execute` entry point
///
/// The `with_*` methods return a new value and leave the receiver untouched.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pagecache::RetryableOperation;
///
/// let base = RetryableOperation::default();
/// let patient = base.with_max_retries(6).with_max_backoff(Duration::from_secs(30));
/// assert_eq!(base.config().max_retries, 3);
/// assert_eq!(patient.config().max_retries, 6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryableOperation {
    config: RetryConfig,
}

impl RetryableOperation {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Copy with a different retry count
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self::new(RetryConfig {
            max_retries,
            ..self.config
        })
    }

    /// Copy with a different first delay
    pub fn with_initial_backoff(&self, initial_backoff: Duration) -> Self {
        Self::new(RetryConfig {
            initial_backoff,
            ..self.config
        })
    }

    /// Copy with a different delay cap
    pub fn with_max_backoff(&self, max_backoff: Duration) -> Self {
        Self::new(RetryConfig {
            max_backoff,
            ..self.config
        })
    }

    /// Runs `operation` with this configuration's retry policy
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &Context,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        retry_with_backoff(ctx, &self.config, operation).await
    }
}
