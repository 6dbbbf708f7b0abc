//! HTTP implementation of [`ContentApi`]
//!
//! Talks JSON over HTTPS with bearer-token authentication. Non-success
//! statuses become [`ApiError::Status`] carrying any `Retry-After` hint, and
//! transport failures are sorted into [`ApiError::Network`] where reqwest can
//! tell what went wrong.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, CollectionQuery, ContentApi, NetworkErrorKind, Page, PageRequest};

/// Default base URL for the content provider
pub const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";

/// API version header sent with every request
const API_VERSION_HEADER: &str = "Notion-Version";

/// API version this client speaks
const API_VERSION: &str = "2022-06-28";

/// Error body returned by the provider on failure
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Client for the content provider's REST API
#[derive(Clone)]
pub struct HttpContentApi {
    client: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for HttpContentApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContentApi")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpContentApi {
    /// Creates a client for `base_url` authenticating with `token`
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    /// Creates a client around an existing reqwest client
    pub fn with_client(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header(API_VERSION_HEADER, API_VERSION)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = builder.send().await.map_err(transport_error)?;
        decode(response).await
    }
}

/// Sorts a reqwest failure into a network error when the cause is known
fn transport_error(err: reqwest::Error) -> ApiError {
    // reqwest includes the URL in its messages; strip it so ids and hosts stay out of logs
    let err = err.without_url();
    let message = err.to_string();
    if err.is_timeout() {
        ApiError::Network {
            kind: NetworkErrorKind::Timeout,
            message,
        }
    } else if err.is_connect() {
        ApiError::Network {
            kind: NetworkErrorKind::Connect,
            message,
        }
    } else {
        ApiError::Http(err)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(transport_error)?;

    if !status.is_success() {
        return Err(status_error(status, &headers, &body));
    }
    Ok(serde_json::from_str(&body)?)
}

/// Builds the error for a non-success response
pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> ApiError {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        Ok(ErrorBody {
            code: Some(code), ..
        }) => code,
        _ => status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
    };

    ApiError::Status {
        status: status.as_u16(),
        message,
        retry_after: retry_after(headers),
    }
}

/// Parses a `Retry-After` header given in (possibly fractional) seconds
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let seconds: f64 = value.parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

#[async_trait]
impl ContentApi for HttpContentApi {
    async fn get_document(&self, id: &str) -> Result<Value, ApiError> {
        self.send(self.request(Method::GET, &format!("pages/{id}")))
            .await
    }

    async fn query_collection(&self, id: &str, query: &CollectionQuery) -> Result<Page, ApiError> {
        self.send(
            self.request(Method::POST, &format!("databases/{id}/query"))
                .json(query),
        )
        .await
    }

    async fn get_children(&self, id: &str, page: &PageRequest) -> Result<Page, ApiError> {
        self.send(
            self.request(Method::GET, &format!("blocks/{id}/children"))
                .query(page),
        )
        .await
    }

    async fn append_children(&self, id: &str, children: &[Value]) -> Result<Page, ApiError> {
        self.send(
            self.request(Method::PATCH, &format!("blocks/{id}/children"))
                .json(&json!({ "children": children })),
        )
        .await
    }

    async fn update_document(&self, id: &str, properties: &Value) -> Result<Value, ApiError> {
        self.send(
            self.request(Method::PATCH, &format!("pages/{id}"))
                .json(&json!({ "properties": properties })),
        )
        .await
    }

    async fn delete_node(&self, id: &str) -> Result<Value, ApiError> {
        self.send(self.request(Method::DELETE, &format!("blocks/{id}")))
            .await
    }
}
