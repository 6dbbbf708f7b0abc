//! Client configuration
//!
//! Defaults suit the hosted provider's published limits. Every field can be
//! overridden from the environment, and the command line overrides that.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use directories::ProjectDirs;
use thiserror::Error;

use crate::api::{LimiterError, RateLimiter, DEFAULT_BASE_URL};
use crate::retry::{RetryConfig, RetryConfigError, RetryableOperation};

/// Environment variable holding the API token
pub const TOKEN_VAR: &str = "PAGECACHE_TOKEN";

/// Directory used when no per-user cache directory can be determined
const FALLBACK_CACHE_DIR: &str = ".pagecache";

/// Errors raised while building or checking a [`ClientConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error("invalid retry settings: {0}")]
    Retry(#[from] RetryConfigError),

    #[error("request timeout must be greater than zero")]
    ZeroTimeout,

    #[error("PAGECACHE_TOKEN is not set")]
    MissingToken,
}

/// Settings for the limiter, retry executor, cache and HTTP client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Sustained operations per second
    pub rate_per_second: f64,
    /// Operations allowed in a burst
    pub burst: u32,
    pub retry: RetryConfig,
    pub cache_dir: PathBuf,
    /// TTL applied to fetched values
    pub default_ttl: TimeDelta,
    pub api_base_url: String,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 2.5,
            burst: 3,
            retry: RetryConfig::default(),
            cache_dir: default_cache_dir(),
            default_ttl: TimeDelta::minutes(5),
            api_base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by environment variables
    ///
    /// Reads:
    /// - `PAGECACHE_RATE` (operations per second)
    /// - `PAGECACHE_BURST`
    /// - `PAGECACHE_MAX_RETRIES`
    /// - `PAGECACHE_CACHE_DIR`
    /// - `PAGECACHE_TTL_SECS` (0 stores entries without expiry)
    /// - `PAGECACHE_API_URL`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`ClientConfig::from_env`] but reads variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(rate) = parse(&lookup, "PAGECACHE_RATE", "a number")? {
            config.rate_per_second = rate;
        }
        if let Some(burst) = parse(&lookup, "PAGECACHE_BURST", "a whole number")? {
            config.burst = burst;
        }
        if let Some(retries) = parse(&lookup, "PAGECACHE_MAX_RETRIES", "a whole number")? {
            config.retry.max_retries = retries;
        }
        if let Some(secs) = parse::<_, i64>(&lookup, "PAGECACHE_TTL_SECS", "a number of seconds")? {
            config.default_ttl = TimeDelta::try_seconds(secs).ok_or(ConfigError::InvalidValue {
                key: "PAGECACHE_TTL_SECS",
                value: secs.to_string(),
                expected: "a number of seconds",
            })?;
        }
        if let Some(dir) = lookup("PAGECACHE_CACHE_DIR").filter(|v| !v.is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("PAGECACHE_API_URL").filter(|v| !v.is_empty()) {
            config.api_base_url = url;
        }

        Ok(config)
    }

    /// Checks limiter, retry and timeout settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            return Err(LimiterError::InvalidRate(self.rate_per_second).into());
        }
        if self.burst == 0 {
            return Err(LimiterError::InvalidBurst.into());
        }
        self.retry.validate()?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Builds the shared limiter described by this configuration
    pub fn rate_limiter(&self) -> Result<RateLimiter, ConfigError> {
        Ok(RateLimiter::new(self.rate_per_second, self.burst)?)
    }

    /// Builds the retry policy described by this configuration
    pub fn retry_operation(&self) -> RetryableOperation {
        RetryableOperation::new(self.retry)
    }
}

/// Reads the API token from [`TOKEN_VAR`]
pub fn token_from_env() -> Result<String, ConfigError> {
    env::var(TOKEN_VAR)
        .ok()
        .filter(|token| !token.trim().is_empty())
        .ok_or(ConfigError::MissingToken)
}

/// Per-user cache directory, or `./.pagecache` when there is no home directory
pub fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("", "", "pagecache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CACHE_DIR))
}

fn parse<F, T>(lookup: &F, key: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key,
                value,
                expected,
            }),
    }
}
