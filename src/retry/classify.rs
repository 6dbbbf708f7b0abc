//! Error classification for retry decisions
//!
//! [`classify`] walks an error's `source()` chain and settles on one
//! [`ErrorKind`] using ordered checks: cancellation first, then structured
//! HTTP statuses, then structured network faults, then a small free-text
//! vocabulary. Anything left over is `Unknown` and retryable, so transient
//! faults nobody anticipated still get another attempt.

use std::error::Error as StdError;
use std::time::Duration;

use crate::api::{as_api_error, ApiError};
use crate::context::CancelReason;

/// Wait used for a rate-limit response that carries no `Retry-After` hint
pub const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(5);

/// Outcome category of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Credentials missing, invalid, or lacking permission (401/403)
    Auth,
    /// Target does not exist (404)
    NotFound,
    /// Request was malformed (400)
    Validation,
    /// Provider throttled the request (429)
    RateLimit,
    /// Provider-side failure or request timeout (408, 5xx)
    ServerError,
    /// Transport-level failure expected to clear up
    NetworkTransient,
    /// Caller's context was cancelled or expired
    Cancelled,
    /// Nothing recognizable
    Unknown,
}

impl ErrorKind {
    /// Whether failures of this kind are worth another attempt
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::NetworkTransient
                | ErrorKind::Unknown
        )
    }
}

/// Retry verdict for a single failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    /// Category of the failure; `None` when there was no failure
    pub kind: Option<ErrorKind>,
    /// Whether the call should be attempted again
    pub retryable: bool,
    /// Wait to use instead of the backoff schedule
    pub retry_after: Option<Duration>,
}

impl Classification {
    /// Verdict for an absent error: not retryable, no kind
    pub fn none() -> Self {
        Self::default()
    }

    fn of(kind: ErrorKind) -> Self {
        Self {
            kind: Some(kind),
            retryable: kind.is_retryable(),
            retry_after: None,
        }
    }

    fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            retry_after: Some(retry_after.unwrap_or(RATE_LIMIT_FALLBACK)),
            ..Self::of(ErrorKind::RateLimit)
        }
    }
}

/// Classifies the error of a result; `Ok` yields [`Classification::none`]
pub fn classify_result<T, E>(result: &Result<T, E>) -> Classification
where
    E: StdError + 'static,
{
    match result {
        Ok(_) => Classification::none(),
        Err(err) => classify(err),
    }
}

/// Maps a failure to a retry decision
pub fn classify(err: &(dyn StdError + 'static)) -> Classification {
    if is_cancellation(err) {
        return Classification::of(ErrorKind::Cancelled);
    }

    if let Some((status, retry_after)) = structured_status(err) {
        // A status outside the table is never reinterpreted from its message.
        return match kind_for_status(status) {
            Some(ErrorKind::RateLimit) => Classification::rate_limited(retry_after),
            Some(kind) => Classification::of(kind),
            None => Classification::of(ErrorKind::Unknown),
        };
    }

    if chain(err).any(is_structured_network) {
        return Classification::of(ErrorKind::NetworkTransient);
    }

    let text = chain_text(err);
    if mentions_auth(&text) {
        Classification::of(ErrorKind::Auth)
    } else if mentions_not_found(&text) {
        Classification::of(ErrorKind::NotFound)
    } else if mentions_rate_limit(&text) {
        Classification::rate_limited(None)
    } else if mentions_server_error(&text) {
        Classification::of(ErrorKind::ServerError)
    } else if mentions_network(&text) {
        Classification::of(ErrorKind::NetworkTransient)
    } else {
        Classification::of(ErrorKind::Unknown)
    }
}

/// True for authentication and authorization failures (401/403)
pub fn is_auth_error(err: &(dyn StdError + 'static)) -> bool {
    status_predicate(err, |s| s == 401 || s == 403, mentions_auth)
}

/// True when the target was not found (404)
pub fn is_not_found_error(err: &(dyn StdError + 'static)) -> bool {
    status_predicate(err, |s| s == 404, mentions_not_found)
}

/// True when the provider throttled the call (429)
pub fn is_rate_limit_error(err: &(dyn StdError + 'static)) -> bool {
    status_predicate(err, |s| s == 429, mentions_rate_limit)
}

/// True for provider-side failures (408, 5xx)
pub fn is_server_error(err: &(dyn StdError + 'static)) -> bool {
    status_predicate(
        err,
        |s| s == 408 || (500..=599).contains(&s),
        mentions_server_error,
    )
}

/// True for transport-level failures: timeouts, refused or reset connections
pub fn is_network_error(err: &(dyn StdError + 'static)) -> bool {
    if is_cancellation(err) || structured_status(err).is_some() {
        return false;
    }
    chain(err).any(is_structured_network) || mentions_network(&chain_text(err))
}

/// Structured status wins when present; otherwise fall back to the text vocabulary
fn status_predicate(
    err: &(dyn StdError + 'static),
    matches_status: impl Fn(u16) -> bool,
    matches_text: impl Fn(&str) -> bool,
) -> bool {
    if is_cancellation(err) {
        return false;
    }
    match structured_status(err) {
        Some((status, _)) => matches_status(status),
        None => matches_text(&chain_text(err)),
    }
}

fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::Auth),
        404 => Some(ErrorKind::NotFound),
        400 => Some(ErrorKind::Validation),
        429 => Some(ErrorKind::RateLimit),
        408 | 500..=599 => Some(ErrorKind::ServerError),
        _ => None,
    }
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn chain_text(err: &(dyn StdError + 'static)) -> String {
    chain(err)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
        .to_lowercase()
}

fn is_cancellation(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        e.is::<CancelReason>()
            || matches!(
                as_api_error(e),
                Some(ApiError::RateLimiterWait { .. } | ApiError::Aborted(_))
            )
    })
}

/// First HTTP status found along the chain, with any retry hint
fn structured_status(err: &(dyn StdError + 'static)) -> Option<(u16, Option<Duration>)> {
    chain(err).find_map(|e| {
        if let Some(ApiError::Status {
            status,
            retry_after,
            ..
        }) = as_api_error(e)
        {
            return Some((*status, *retry_after));
        }
        e.downcast_ref::<reqwest::Error>()
            .and_then(reqwest::Error::status)
            .map(|status| (status.as_u16(), None))
    })
}

fn is_structured_network(err: &(dyn StdError + 'static)) -> bool {
    if let Some(ApiError::Network { .. }) = as_api_error(err) {
        return true;
    }
    if let Some(err) = err.downcast_ref::<reqwest::Error>() {
        return err.is_timeout() || err.is_connect();
    }
    if let Some(err) = err.downcast_ref::<std::io::Error>() {
        use std::io::ErrorKind as Io;
        return matches!(
            err.kind(),
            Io::TimedOut
                | Io::ConnectionRefused
                | Io::ConnectionReset
                | Io::ConnectionAborted
                | Io::BrokenPipe
                | Io::Interrupted
                | Io::WouldBlock
        );
    }
    false
}

/// Three-digit numbers standing alone in the text, e.g. "HTTP 503:"
fn status_codes(text: &str) -> impl Iterator<Item = u16> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse().ok())
}

fn mentions_auth(text: &str) -> bool {
    status_codes(text).any(|s| s == 401 || s == 403)
        || text.contains("unauthorized")
        || text.contains("forbidden")
}

fn mentions_not_found(text: &str) -> bool {
    status_codes(text).any(|s| s == 404) || text.contains("not found")
}

fn mentions_rate_limit(text: &str) -> bool {
    status_codes(text).any(|s| s == 429) || text.contains("rate limit")
}

fn mentions_server_error(text: &str) -> bool {
    status_codes(text).any(|s| (500..=599).contains(&s))
}

fn mentions_network(text: &str) -> bool {
    const VOCABULARY: [&str; 6] = [
        "timeout",
        "connection refused",
        "no such host",
        "connection reset",
        "broken pipe",
        "deadline exceeded",
    ];
    VOCABULARY.iter().any(|phrase| text.contains(phrase))
}
