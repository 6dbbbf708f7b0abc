//! Remote content API access
//!
//! This module defines the capability set the application consumes from the
//! content provider ([`ContentApi`]), an HTTP implementation of it, and the
//! [`RateLimitedClient`] wrapper that gates every call through a shared
//! [`RateLimiter`] and annotates failures with the operation and target.

mod client;
mod error;
mod http;
mod limiter;

pub use client::RateLimitedClient;
pub use error::{as_api_error, ApiError, NetworkErrorKind};
pub use http::{HttpContentApi, DEFAULT_BASE_URL};
pub use limiter::{LimiterError, RateLimiter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest page size the provider accepts
pub const MAX_PAGE_SIZE: u32 = 100;

/// Cursor-based pagination request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Cursor returned by the previous page, `None` for the first page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<String>,
    /// Number of results per page, capped at [`MAX_PAGE_SIZE`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

impl PageRequest {
    /// Request for the page following `cursor`
    pub fn after(cursor: impl Into<String>) -> Self {
        Self {
            start_cursor: Some(cursor.into()),
            page_size: None,
        }
    }

    /// Sets the page size, clamped to `1..=MAX_PAGE_SIZE`
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size.clamp(1, MAX_PAGE_SIZE));
        self
    }
}

/// Query against a collection, with optional filter and sort clauses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionQuery {
    /// Provider-specific filter object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    /// Provider-specific sort clauses, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sorts: Vec<Value>,
    /// Pagination for the result set
    #[serde(flatten)]
    pub page: PageRequest,
}

/// One page of results from a list-style operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Items on this page
    #[serde(default)]
    pub results: Vec<Value>,
    /// Cursor for the next page, when there is one
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Whether more pages follow
    #[serde(default)]
    pub has_more: bool,
}

/// Operations offered by the remote content provider
///
/// Implementations perform exactly one remote call per method; rate limiting,
/// retries and caching are layered on top by the rest of this crate.
#[async_trait]
pub trait ContentApi: Send + Sync {
    /// Reads a document by id
    async fn get_document(&self, id: &str) -> Result<Value, ApiError>;

    /// Queries a collection by id
    async fn query_collection(&self, id: &str, query: &CollectionQuery)
        -> Result<Page, ApiError>;

    /// Reads one page of a node's children
    async fn get_children(&self, id: &str, page: &PageRequest) -> Result<Page, ApiError>;

    /// Appends children to a node
    async fn append_children(&self, id: &str, children: &[Value]) -> Result<Page, ApiError>;

    /// Updates a document's properties
    async fn update_document(&self, id: &str, properties: &Value) -> Result<Value, ApiError>;

    /// Deletes (archives) a node
    async fn delete_node(&self, id: &str) -> Result<Value, ApiError>;
}
