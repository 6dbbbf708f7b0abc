//! Token-bucket rate limiter shared by every remote call
//!
//! Built on governor's GCRA limiter, which behaves like a token bucket that
//! refills at `rate_per_second` and holds at most `burst` permits. Waiting
//! for a permit is raced against the caller's [`Context`]; a wait that loses
//! the race leaves the bucket untouched.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use thiserror::Error;
use tracing::{debug, trace};

use crate::context::{CancelReason, Context};

type DirectRateLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Invalid limiter settings
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimiterError {
    /// Rate must be a finite number of operations per second above zero
    #[error("invalid rate {0}: must be a positive, finite number of operations per second")]
    InvalidRate(f64),
    /// Burst capacity must allow at least one operation
    #[error("invalid burst capacity: must be at least 1")]
    InvalidBurst,
}

/// Shared gate bounding the outbound call rate
///
/// Cloning is cheap and every clone draws from the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<DirectRateLimiter>,
    rate_per_second: f64,
    burst: NonZeroU32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_per_second", &self.rate_per_second)
            .field("burst", &self.burst)
            .finish()
    }
}

impl RateLimiter {
    /// Creates a limiter refilling `rate_per_second` permits with room for `burst`
    ///
    /// # Example
    ///
    /// ```
    /// use pagecache::RateLimiter;
    ///
    /// let limiter = RateLimiter::new(2.5, 3).expect("valid settings");
    /// assert_eq!(limiter.burst(), 3);
    /// ```
    pub fn new(rate_per_second: f64, burst: u32) -> Result<Self, LimiterError> {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return Err(LimiterError::InvalidRate(rate_per_second));
        }
        let burst = NonZeroU32::new(burst).ok_or(LimiterError::InvalidBurst)?;
        let period = Duration::try_from_secs_f64(1.0 / rate_per_second)
            .map_err(|_| LimiterError::InvalidRate(rate_per_second))?;
        let quota = Quota::with_period(period)
            .ok_or(LimiterError::InvalidRate(rate_per_second))?
            .allow_burst(burst);

        debug!(rate_per_second, burst = burst.get(), "Creating rate limiter");

        Ok(Self {
            bucket: Arc::new(GovernorRateLimiter::direct(quota)),
            rate_per_second,
            burst,
        })
    }

    /// Sustained rate in permits per second
    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    /// Maximum number of permits available at once
    pub fn burst(&self) -> u32 {
        self.burst.get()
    }

    /// Takes a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }

    /// Waits for one permit, giving up when `ctx` is cancelled or expires
    ///
    /// An already-done context fails without consuming a permit.
    pub async fn acquire(&self, ctx: &Context) -> Result<(), CancelReason> {
        if let Some(reason) = ctx.err() {
            return Err(reason);
        }

        tokio::select! {
            biased;
            reason = ctx.done() => {
                trace!(%reason, "Rate limiter wait abandoned");
                Err(reason)
            }
            _ = self.bucket.until_ready() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_settings() {
        assert_eq!(
            RateLimiter::new(0.0, 3).unwrap_err(),
            LimiterError::InvalidRate(0.0)
        );
        assert!(matches!(
            RateLimiter::new(f64::NAN, 3),
            Err(LimiterError::InvalidRate(_))
        ));
        assert_eq!(
            RateLimiter::new(2.5, 0).unwrap_err(),
            LimiterError::InvalidBurst
        );
    }

    #[test]
    fn test_burst_capacity_is_available_immediately() {
        let limiter = RateLimiter::new(0.1, 3).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire(), "fourth permit exceeds the burst");
    }

    #[test]
    fn test_clones_share_the_bucket() {
        let limiter = RateLimiter::new(0.1, 1).unwrap();
        let clone = limiter.clone();
        assert!(limiter.try_acquire());
        assert!(!clone.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_within_burst_returns_immediately() {
        let limiter = RateLimiter::new(0.1, 2).unwrap();
        let ctx = Context::new();
        limiter.acquire(&ctx).await.unwrap();
        limiter.acquire(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_fails_on_cancelled_context_without_taking_a_permit() {
        let limiter = RateLimiter::new(0.1, 1).unwrap();
        let ctx = Context::new();
        ctx.cancel();

        assert_eq!(limiter.acquire(&ctx).await, Err(CancelReason::Cancelled));
        assert!(limiter.try_acquire(), "permit should still be available");
    }

    #[tokio::test]
    async fn test_acquire_gives_up_at_deadline() {
        let limiter = RateLimiter::new(0.1, 1).unwrap();
        assert!(limiter.try_acquire());

        let ctx = Context::with_timeout(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let result = limiter.acquire(&ctx).await;

        assert_eq!(result, Err(CancelReason::DeadlineExceeded));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "wait should stop near the deadline, not at the next refill"
        );
    }
}
