//! Errors produced by remote content API calls

use std::time::Duration;

use thiserror::Error;

use crate::context::CancelReason;

/// Broad category of a network-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// The request or connection timed out
    Timeout,
    /// The connection could not be established (refused, DNS failure)
    Connect,
    /// An established connection was reset or closed mid-request
    Closed,
}

/// Errors that can occur when talking to the content API
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Server hint from a `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// The request never produced a response
    #[error("network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// HTTP client failure that is neither a status nor a known network fault
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to parse the response body
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Waiting for a rate-limit permit lost the race against the caller's context
    #[error("rate limiter wait for {operation} {target}: {reason}")]
    RateLimiterWait {
        operation: &'static str,
        target: String,
        #[source]
        reason: CancelReason,
    },

    /// The caller's context fired while the request was in flight
    #[error("request aborted: {0}")]
    Aborted(#[source] CancelReason),

    /// A failure annotated with the operation and the node it targeted
    #[error("{operation} {target}: {source}")]
    Operation {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<ApiError>,
    },

    /// Any other failure, described in free text
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Wraps `self` with the operation name and target identifier
    pub fn in_operation(self, operation: &'static str, target: impl Into<String>) -> Self {
        ApiError::Operation {
            operation,
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error beneath any operation annotations
    pub fn root(&self) -> &ApiError {
        match self {
            ApiError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the HTTP status carried by this error, looking through annotations
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Returns true when the error came from a rate limiter wait
    pub fn is_rate_limiter_wait(&self) -> bool {
        matches!(self.root(), ApiError::RateLimiterWait { .. })
    }
}

/// Views a link of an error chain as an `ApiError`
///
/// Operation annotations box their source, so the chain yields
/// `Box<ApiError>` links as well as bare ones.
pub fn as_api_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a ApiError> {
    err.downcast_ref::<ApiError>()
        .or_else(|| err.downcast_ref::<Box<ApiError>>().map(|boxed| boxed.as_ref()))
}
