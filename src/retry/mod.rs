//! Error classification and retry with exponential backoff
//!
//! [`classify`] turns any failure into an [`ErrorKind`] and a retry verdict;
//! [`RetryableOperation`] uses those verdicts to re-run an operation on a
//! capped exponential schedule, racing each wait against the caller's
//! [`Context`](crate::Context).

mod backoff;
mod classify;
mod operation;

pub use backoff::{Backoff, RetryConfig, RetryConfigError};
pub use classify::{
    classify, classify_result, is_auth_error, is_network_error, is_not_found_error,
    is_rate_limit_error, is_server_error, Classification, ErrorKind, RATE_LIMIT_FALLBACK,
};
pub use operation::{retry_with_backoff, RetryError, RetryableOperation};
