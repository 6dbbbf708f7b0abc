//! Errors produced by the local cache

use std::path::PathBuf;

use thiserror::Error;

use crate::context::CancelReason;

/// Errors that can occur when reading or writing cache entries
///
/// `Miss` and `Expired` are expected outcomes: callers fall back to a live
/// fetch rather than treating them as failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache directory path is unusable
    #[error("invalid cache directory: {0}")]
    InvalidDirectory(String),

    /// No entry is stored under the key
    #[error("cache miss: {0}")]
    Miss(String),

    /// The entry exists but has outlived its TTL
    #[error("cache entry expired: {0}")]
    Expired(String),

    /// The entry file exists but could not be parsed
    #[error("failed to unmarshal cache entry {key}: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The value could not be encoded
    #[error("failed to serialize cache entry {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The caller's context was done before or during the operation
    #[error("cache operation cancelled: {0}")]
    Cancelled(#[from] CancelReason),

    /// Filesystem failure
    #[error("cache I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for outcomes that mean "fetch it live": miss, expiry, corrupt entry
    pub fn is_fallthrough(&self) -> bool {
        matches!(
            self,
            CacheError::Miss(_) | CacheError::Expired(_) | CacheError::Deserialize { .. }
        )
    }
}
