//! Retry configuration and the exponential backoff schedule

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings that violate the retry invariants
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryConfigError {
    #[error("initial backoff must be greater than zero")]
    ZeroInitialBackoff,
    #[error("max backoff ({max:?}) must be at least the initial backoff ({initial:?})")]
    MaxBelowInitial { initial: Duration, max: Duration },
    #[error("backoff multiplier must be a finite number greater than 1, got {0}")]
    InvalidMultiplier(f64),
}

/// How many times to retry and how long to wait in between
///
/// Total attempts are `max_retries + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Checks the invariants the executor relies on
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(RetryConfigError::ZeroInitialBackoff);
        }
        if self.max_backoff < self.initial_backoff {
            return Err(RetryConfigError::MaxBelowInitial {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(RetryConfigError::InvalidMultiplier(self.backoff_multiplier));
        }
        Ok(())
    }

    /// Delay schedule for this configuration
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_backoff,
            max: self.max_backoff,
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Endless sequence of capped, exponentially growing delays
///
/// With 1s initial, 16s cap and a multiplier of 2 it yields
/// 1s, 2s, 4s, 8s, 16s, 16s, ...
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        Some(current)
    }
}
