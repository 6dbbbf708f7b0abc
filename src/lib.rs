//! pagecache library
//!
//! A resilient data-access layer for a rate-limited content API: a shared
//! token-bucket limiter in front of every remote call, an error classifier
//! and retry executor with exponential backoff, and a durable local cache
//! with per-entry TTL and hit/miss accounting. Every wait observes the
//! caller's [`Context`].

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod fetcher;
pub mod retry;

pub use api::{ApiError, ContentApi, HttpContentApi, RateLimitedClient, RateLimiter};
pub use cache::{Cache, CacheEntry, CacheError, CacheStats};
pub use config::{ClientConfig, ConfigError};
pub use context::{CancelReason, Context};
pub use fetcher::{CachedFetcher, FetchError};
pub use retry::{classify, ErrorKind, RetryConfig, RetryError, RetryableOperation};
