//! Rate-limited wrapper around a [`ContentApi`]

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use super::{ApiError, CollectionQuery, ContentApi, Page, PageRequest, RateLimiter};
use crate::context::Context;

/// Exposes the provider's operations, each gated by a shared [`RateLimiter`]
///
/// Every call follows the same sequence: wait for a permit (racing the
/// caller's context), invoke the inner API (again racing the context), and on
/// failure annotate the error with the operation name and target id.
pub struct RateLimitedClient<A: ?Sized> {
    api: Arc<A>,
    limiter: RateLimiter,
}

impl<A: ?Sized> Clone for RateLimitedClient<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            limiter: self.limiter.clone(),
        }
    }
}

impl<A: ?Sized> std::fmt::Debug for RateLimitedClient<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<A: ContentApi + ?Sized> RateLimitedClient<A> {
    /// Wraps `api`, drawing permits from `limiter`
    pub fn new(api: Arc<A>, limiter: RateLimiter) -> Self {
        Self { api, limiter }
    }

    /// The shared limiter gating this client
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn gated<T>(
        &self,
        ctx: &Context,
        operation: &'static str,
        target: &str,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        self.limiter
            .acquire(ctx)
            .await
            .map_err(|reason| ApiError::RateLimiterWait {
                operation,
                target: target.to_string(),
                reason,
            })?;

        debug!(operation, target, "Issuing remote call");

        let result = tokio::select! {
            biased;
            reason = ctx.done() => Err(ApiError::Aborted(reason)),
            result = call => result,
        };
        result.map_err(|err| err.in_operation(operation, target))
    }

    /// Reads a document by id
    #[instrument(skip(self, ctx))]
    pub async fn get_document(&self, ctx: &Context, id: &str) -> Result<Value, ApiError> {
        self.gated(ctx, "get_document", id, self.api.get_document(id))
            .await
    }

    /// Queries a collection by id
    #[instrument(skip(self, ctx, query))]
    pub async fn query_collection(
        &self,
        ctx: &Context,
        id: &str,
        query: &CollectionQuery,
    ) -> Result<Page, ApiError> {
        self.gated(ctx, "query_collection", id, self.api.query_collection(id, query))
            .await
    }

    /// Reads one page of a node's children
    #[instrument(skip(self, ctx, page))]
    pub async fn get_children(
        &self,
        ctx: &Context,
        id: &str,
        page: &PageRequest,
    ) -> Result<Page, ApiError> {
        self.gated(ctx, "get_children", id, self.api.get_children(id, page))
            .await
    }

    /// Reads every child of a node, following cursors until the last page
    ///
    /// Each page draws its own permit from the limiter.
    #[instrument(skip(self, ctx))]
    pub async fn collect_children(&self, ctx: &Context, id: &str) -> Result<Vec<Value>, ApiError> {
        let mut children = Vec::new();
        let mut request = PageRequest::default().with_page_size(super::MAX_PAGE_SIZE);

        loop {
            let page = self.get_children(ctx, id, &request).await?;
            children.extend(page.results);
            match page.next_cursor {
                Some(cursor) if page.has_more => {
                    request.start_cursor = Some(cursor);
                }
                _ => break,
            }
        }

        debug!(id, count = children.len(), "Collected children");
        Ok(children)
    }

    /// Appends children to a node
    #[instrument(skip(self, ctx, children), fields(count = children.len()))]
    pub async fn append_children(
        &self,
        ctx: &Context,
        id: &str,
        children: &[Value],
    ) -> Result<Page, ApiError> {
        self.gated(ctx, "append_children", id, self.api.append_children(id, children))
            .await
    }

    /// Updates a document's properties
    #[instrument(skip(self, ctx, properties))]
    pub async fn update_document(
        &self,
        ctx: &Context,
        id: &str,
        properties: &Value,
    ) -> Result<Value, ApiError> {
        self.gated(ctx, "update_document", id, self.api.update_document(id, properties))
            .await
    }

    /// Deletes (archives) a node
    #[instrument(skip(self, ctx))]
    pub async fn delete_node(&self, ctx: &Context, id: &str) -> Result<Value, ApiError> {
        self.gated(ctx, "delete_node", id, self.api.delete_node(id))
            .await
    }
}
