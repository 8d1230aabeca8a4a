//! HTTP transport seam.
//!
//! `RequestClient` and `StreamTransport` only ever talk to these traits, so the
//! reqwest-backed implementation can be swapped for a scripted one in tests.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, Method};
use serde_json::Value;

use crate::errors::ApiError;

/// An outgoing call, fully resolved (absolute URL, auth header attached).
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces any existing `Authorization` header.
    pub fn set_bearer(&mut self, token: &str) {
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {token}")));
    }
}

/// A response that reached the caller, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            retry_after: None,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, ApiError>>;

/// Request/response transport. `Err` is reserved for network-level failures;
/// error statuses come back as `Ok(ApiResponse)`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse, ApiError>;
}

/// Long-lived body transport for event streams. A non-2xx status is an `Err`
/// carrying the normalized server error.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, request: HttpRequest) -> Result<ByteStream, ApiError>;
}

/// The production transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    /// No overall timeout: it would cut long-lived streams off mid-body.
    stream_client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to build HTTP client")?,
            stream_client: Client::builder()
                .connect_timeout(timeout)
                .build()
                .context("Failed to build streaming HTTP client")?,
        })
    }

    fn build(&self, client: &Client, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = client.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse, ApiError> {
        let response = self
            .build(&self.client, &request)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(classify)?;

        Ok(ApiResponse {
            status,
            retry_after,
            body: parse_body(&text),
        })
    }
}

#[async_trait]
impl StreamConnector for ReqwestTransport {
    async fn connect(&self, request: HttpRequest) -> Result<ByteStream, ApiError> {
        let response = self
            .build(&self.stream_client, &request)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_response(status.as_u16(), &parse_body(&text)));
        }

        Ok(response.bytes_stream().map(|r| r.map_err(classify)).boxed())
    }
}

/// Empty bodies become `null`; non-JSON bodies are kept as a string.
pub fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn classify(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::network("Request timed out")
    } else {
        ApiError::network(format!("Network error: {error}"))
    }
}
