//! Cache-through reads of remote content
//!
//! A lookup first asks the local cache. On a miss, an expired entry or an
//! unreadable file it fetches live through the retry executor and the
//! rate-limited client, then stores the result with the configured TTL.

use std::future::Future;
use std::sync::Arc;

use chrono::TimeDelta;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::api::{ApiError, CollectionQuery, ContentApi, Page, RateLimitedClient};
use crate::cache::{Cache, CacheError};
use crate::context::{CancelReason, Context};
use crate::retry::{RetryError, RetryableOperation};

/// Terminal failure of a cache-through read
#[derive(Debug, Error)]
pub enum FetchError {
    /// The live fetch failed permanently, ran out of retries, or was cancelled mid-retry
    #[error(transparent)]
    Remote(#[from] RetryError<ApiError>),

    /// The context was done before the live fetch started
    #[error("fetch cancelled: {0}")]
    Cancelled(#[source] CancelReason),
}

/// Serves documents from the cache, falling back to the remote API
pub struct CachedFetcher<A: ?Sized> {
    cache: Arc<Cache>,
    client: RateLimitedClient<A>,
    retry: RetryableOperation,
    ttl: TimeDelta,
}

impl<A: ?Sized> std::fmt::Debug for CachedFetcher<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFetcher")
            .field("cache", &self.cache.dir())
            .field("retry", &self.retry)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<A: ContentApi + ?Sized> CachedFetcher<A> {
    pub fn new(
        cache: Arc<Cache>,
        client: RateLimitedClient<A>,
        retry: RetryableOperation,
        ttl: TimeDelta,
    ) -> Self {
        Self {
            cache,
            client,
            retry,
            ttl,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn client(&self) -> &RateLimitedClient<A> {
        &self.client
    }

    /// TTL applied to values stored after a live fetch
    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Reads a document, from cache when fresh
    #[instrument(skip(self, ctx))]
    pub async fn document(&self, ctx: &Context, id: &str) -> Result<Value, FetchError> {
        let key = document_key(id);
        self.through(ctx, &key, move || self.client.get_document(ctx, id))
            .await
    }

    /// Reads several documents concurrently; results keep the order of `ids`
    pub async fn documents<S: AsRef<str>>(
        &self,
        ctx: &Context,
        ids: &[S],
    ) -> Vec<Result<Value, FetchError>> {
        join_all(ids.iter().map(|id| self.document(ctx, id.as_ref()))).await
    }

    /// Reads every child of a node, from cache when fresh
    #[instrument(skip(self, ctx))]
    pub async fn children(&self, ctx: &Context, id: &str) -> Result<Vec<Value>, FetchError> {
        let key = children_key(id);
        self.through(ctx, &key, move || self.client.collect_children(ctx, id))
            .await
    }

    /// Runs a collection query, from cache when the same query is fresh
    #[instrument(skip(self, ctx, query))]
    pub async fn collection(
        &self,
        ctx: &Context,
        id: &str,
        query: &CollectionQuery,
    ) -> Result<Page, FetchError> {
        let key = collection_key(id, query);
        self.through(ctx, &key, move || self.client.query_collection(ctx, id, query))
            .await
    }

    /// Drops the cached document and children of `id`
    pub async fn invalidate(&self, id: &str) -> Result<(), CacheError> {
        self.cache.delete(&document_key(id)).await?;
        self.cache.delete(&children_key(id)).await
    }

    async fn through<T, F, Fut>(&self, ctx: &Context, key: &str, fetch: F) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match self.cache.get::<T>(ctx, key).await {
            Ok(value) => {
                debug!(key, "Serving from cache");
                return Ok(value);
            }
            Err(CacheError::Cancelled(reason)) => return Err(FetchError::Cancelled(reason)),
            Err(err) if err.is_fallthrough() => {
                debug!(key, reason = %err, "Fetching live");
            }
            Err(err) => {
                warn!(key, error = %err, "Cache read failed, fetching live");
            }
        }

        let value = self.retry.execute(ctx, fetch).await?;

        if let Err(err) = self.cache.set(ctx, key, &value, self.ttl).await {
            warn!(key, error = %err, "Failed to store fetched value");
        }
        Ok(value)
    }
}

pub fn document_key(id: &str) -> String {
    format!("document:{id}")
}

pub fn children_key(id: &str) -> String {
    format!("children:{id}")
}

/// Key for a collection query; serde_json orders object keys, so equal queries share a key
pub fn collection_key(id: &str, query: &CollectionQuery) -> String {
    let encoded = serde_json::to_string(query).unwrap_or_default();
    format!("collection:{id}:{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PageRequest, RateLimiter};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fails the first `failures` document reads with 503
    #[derive(Default)]
    struct FlakyApi {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentApi for FlakyApi {
        async fn get_document(&self, id: &str) -> Result<Value, ApiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ApiError::Status {
                    status: 503,
                    message: "service unavailable".to_string(),
                    retry_after: None,
                });
            }
            Ok(json!({ "id": id, "call": call }))
        }

        async fn query_collection(
            &self,
            id: &str,
            query: &CollectionQuery,
        ) -> Result<Page, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Page {
                results: vec![json!({ "collection": id, "filter": query.filter })],
                ..Page::default()
            })
        }

        async fn get_children(&self, _id: &str, _page: &PageRequest) -> Result<Page, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Page {
                results: vec![json!("child")],
                ..Page::default()
            })
        }

        async fn append_children(&self, _id: &str, _children: &[Value]) -> Result<Page, ApiError> {
            unimplemented!()
        }

        async fn update_document(&self, _id: &str, _properties: &Value) -> Result<Value, ApiError> {
            unimplemented!()
        }

        async fn delete_node(&self, _id: &str) -> Result<Value, ApiError> {
            unimplemented!()
        }
    }

    async fn create_fetcher(failures: usize) -> (CachedFetcher<FlakyApi>, Arc<FlakyApi>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let cache = Arc::new(Cache::open(temp_dir.path()).await.unwrap());
        let api = Arc::new(FlakyApi {
            failures,
            ..FlakyApi::default()
        });
        let client = RateLimitedClient::new(Arc::clone(&api), RateLimiter::new(1000.0, 10).unwrap());
        let retry = RetryableOperation::default()
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(4));
        let fetcher = CachedFetcher::new(cache, client, retry, TimeDelta::minutes(5));
        (fetcher, api, temp_dir)
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let (fetcher, api, _temp_dir) = create_fetcher(0).await;
        let ctx = Context::new();

        let first = fetcher.document(&ctx, "doc-1").await.unwrap();
        let second = fetcher.document(&ctx, "doc-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        let stats = fetcher.cache().stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_cached() {
        let (fetcher, api, _temp_dir) = create_fetcher(2).await;
        let ctx = Context::new();

        let doc = fetcher.document(&ctx, "doc-1").await.unwrap();
        assert_eq!(doc["call"], json!(2));
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert!(fetcher.cache().contains(&document_key("doc-1")).await);
    }

    #[tokio::test]
    async fn test_exhausted_retries_store_nothing() {
        let (fetcher, api, _temp_dir) = create_fetcher(usize::MAX).await;

        let err = fetcher.document(&Context::new(), "doc-1").await.unwrap_err();

        assert!(matches!(err, FetchError::Remote(RetryError::Exhausted { attempts: 4, .. })));
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
        assert_eq!(fetcher.cache().stats().size, 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_remote() {
        let (fetcher, api, _temp_dir) = create_fetcher(0).await;
        let ctx = Context::new();
        ctx.cancel();

        let err = fetcher.document(&ctx, "doc-1").await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled(CancelReason::Cancelled)));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_live_fetch() {
        let (fetcher, api, _temp_dir) = create_fetcher(0).await;
        let ctx = Context::new();

        fetcher.document(&ctx, "doc-1").await.unwrap();
        fetcher.children(&ctx, "doc-1").await.unwrap();
        fetcher.invalidate("doc-1").await.unwrap();
        fetcher.document(&ctx, "doc-1").await.unwrap();

        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert!(!fetcher.cache().contains(&children_key("doc-1")).await);
    }

    #[test]
    fn test_collection_key_depends_on_query() {
        let open = CollectionQuery::default();
        let filtered = CollectionQuery {
            filter: Some(json!({ "property": "Status", "select": { "equals": "Done" } })),
            ..CollectionQuery::default()
        };
        assert_eq!(collection_key("db", &open), collection_key("db", &open.clone()));
        assert_ne!(collection_key("db", &open), collection_key("db", &filtered));
        assert_ne!(collection_key("db", &open), collection_key("other", &open));
    }
}
