//! Cancellation and deadline handle shared by every suspension point
//!
//! A `Context` is handed down from the outermost caller to the rate limiter,
//! the retry executor, and the cache. Each of those races its own wait
//! against `Context::done` so that no operation outlives the caller's
//! deadline or an explicit cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context stopped accepting work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    /// `Context::cancel` was called on this context or an ancestor
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug)]
struct Inner {
    cancelled: watch::Sender<bool>,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

/// Cloneable cancellation handle with an optional deadline
///
/// Clones share state: cancelling any clone cancels all of them. Children
/// created with [`Context::child`] or [`Context::child_with_timeout`] observe
/// their parent's cancellation but can be cancelled independently.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context that never expires on its own
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Creates a context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout), None)
    }

    /// Creates a context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline), None)
    }

    /// Creates a child that is cancelled whenever this context is
    pub fn child(&self) -> Self {
        Self::build(self.inner.deadline, Some(self.clone()))
    }

    /// Creates a child whose deadline is the earlier of the parent's and `timeout` from now
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(parent) => Some(parent.min(own)),
            None => Some(own),
        };
        Self::build(deadline, Some(self.clone()))
    }

    fn build(deadline: Option<Instant>, parent: Option<Context>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cancelled,
                deadline,
                parent,
            }),
        }
    }

    /// Returns the effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Cancels this context and every child derived from it
    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Returns the reason this context is done, or `None` while it is still live
    pub fn err(&self) -> Option<CancelReason> {
        if *self.inner.cancelled.borrow() {
            return Some(CancelReason::Cancelled);
        }
        if let Some(reason) = self.inner.parent.as_ref().and_then(Context::err) {
            return Some(reason);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns true once the context is cancelled or past its deadline
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context is cancelled or its deadline passes
    ///
    /// Intended to be raced against another future with `tokio::select!`.
    pub fn done(&self) -> BoxFuture<'_, CancelReason> {
        async move {
            let mut rx = self.inner.cancelled.subscribe();
            let cancelled = async {
                // The sender lives as long as `self`, so this only returns on cancel.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            };
            let parent = async {
                match &self.inner.parent {
                    Some(parent) => parent.done().await,
                    None => futures::future::pending().await,
                }
            };
            let deadline = async {
                match self.inner.deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancelled => CancelReason::Cancelled,
                reason = parent => reason,
                _ = deadline => CancelReason::DeadlineExceeded,
            }
        }
        .boxed()
    }
}
