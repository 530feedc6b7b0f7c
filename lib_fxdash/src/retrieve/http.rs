//! # HTTP Retrieval Utilities
//!
//! An asynchronous JSON API client around `reqwest`. Requests are not retried
//! here: the request queue is the single place where backend load is shaped,
//! and a hidden retry layer underneath it would multiply calls it cannot see.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::core::QueueError;

/// Everything that can go wrong talking to the backend.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The base URL or a path could not be turned into a URL.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The request never produced a response (DNS, connect, timeout, TLS).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Numeric status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// The backend answered 503. Transient; the caller may resubmit later.
    #[error("service unavailable: {body}")]
    ServiceUnavailable {
        /// Raw response body.
        body: String,
    },

    /// A success response whose body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The request body could not be serialized.
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// The request queue rejected or abandoned the call.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    /// Whether resubmitting the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::ServiceUnavailable { .. } => true,
            ApiError::Network(e) => e.is_timeout() || e.is_connect(),
            ApiError::Queue(e) => matches!(e, QueueError::QueueFull { .. } | QueueError::Timeout { .. }),
            _ => false,
        }
    }
}

/// A decoded response plus the transaction metadata.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a success response.
    pub data: Option<T>,
    /// The raw body of a failed response.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Whether the status was 2xx.
    pub success: bool,
    /// Response headers.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// The body of a success response, or the matching [`ApiError`].
    pub fn into_result(self) -> Result<T, ApiError> {
        let body = self.error_body.unwrap_or_default();
        match (self.data, self.status) {
            (Some(data), _) if self.success => Ok(data),
            (_, 503) => Err(ApiError::ServiceUnavailable { body }),
            (_, status) => Err(ApiError::Status { status, body }),
        }
    }
}

/// # API Client
///
/// Joins relative paths onto a base URL, injects an optional bearer token and
/// speaks JSON both ways. An empty success body decodes as JSON `null`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client for `base_url` with a per-request `timeout`.
    ///
    /// The base URL is treated as a directory: `http://host/api` and
    /// `http://host/api/` both resolve `positions` to `http://host/api/positions`.
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let mut url = Url::parse(base_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let inner = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            inner,
            base_url: url,
            auth_token,
        })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL. Leading slashes are ignored so
    /// that paths never escape the base path.
    pub fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Performs a request and returns the response with its metadata.
    ///
    /// Non-success statuses are not errors at this level; see
    /// [`ApiResponse::into_result`].
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self.url_for(path)?;
        tracing::debug!(%method, url = %full_url, "Backend request");
        let mut req = self.inner.request(method.clone(), full_url.clone());

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(b).map_err(ApiError::Encode)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let text = response.text().await?;
            let text = if text.trim().is_empty() { "null" } else { text.as_str() };
            let data = serde_json::from_str::<T>(text).map_err(ApiError::Decode)?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.unwrap_or_default();
            if status == StatusCode::SERVICE_UNAVAILABLE {
                tracing::warn!(%method, url = %full_url, "Backend temporarily unavailable (503)");
            } else {
                tracing::error!(%method, url = %full_url, status = status.as_u16(), body = %error_text, "Backend request failed");
            }
            Ok(ApiResponse {
                data: None,
                error_body: Some(error_text),
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Performs a request and returns the decoded body of a success response.
    pub async fn json<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request::<T, B>(method, path, None, body).await?.into_result()
    }
}
