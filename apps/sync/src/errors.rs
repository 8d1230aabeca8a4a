use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure taxonomy shared by the request client, the stream transport and
/// the notification store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No response reached the caller (connect failure, reset, timeout).
    Network,
    /// 401: recoverable through the refresh flow.
    AuthExpired,
    /// 429: recoverable by waiting.
    RateLimited,
    /// 503: the feature is not configured on this deployment.
    ServiceUnavailable,
    /// 400/422 carrying per-field errors.
    Validation,
    NotFound,
    /// Any other 4xx.
    Rejected,
    /// 5xx other than 503.
    ServerFault,
    /// Malformed event framing or a non-JSON data payload.
    StreamFraming,
    /// The server sent an `error` event on an open stream.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: Option<String>,
    pub message: String,
}

/// The one structured failure shape handed to feature code.
///
/// Transport-specific errors (reqwest, io, timeouts) never cross this boundary;
/// they are classified into an [`ErrorKind`] first.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub errors: Vec<FieldError>,
    pub is_retryable: bool,
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            message: message.into(),
            status: None,
            errors: Vec::new(),
            is_retryable: true,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::network(format!("Request timed out after {}s", after.as_secs()))
    }

    /// A server-sent `error` event. The server already gave up, so retrying the
    /// same stream is pointless.
    pub fn stream(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Stream,
            message: message.into(),
            status: None,
            errors: Vec::new(),
            is_retryable: false,
        }
    }

    pub fn framing(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::StreamFraming,
            message: message.into(),
            status: None,
            errors: Vec::new(),
            is_retryable: false,
        }
    }

    /// A success response whose body does not have the expected shape. No
    /// error status was sent, and repeating the call returns the same body.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ServerFault,
            message: message.into(),
            status: None,
            errors: Vec::new(),
            is_retryable: false,
        }
    }

    /// Normalizes an error status and its (possibly empty) JSON body.
    pub fn from_response(status: u16, body: &Value) -> Self {
        let errors = extract_field_errors(body);
        let message = extract_message(body).unwrap_or_else(|| default_message(status));

        let kind = match status {
            401 => ErrorKind::AuthExpired,
            404 => ErrorKind::NotFound,
            422 => ErrorKind::Validation,
            400 if !errors.is_empty() => ErrorKind::Validation,
            429 => ErrorKind::RateLimited,
            503 => ErrorKind::ServiceUnavailable,
            500..=599 => ErrorKind::ServerFault,
            _ if looks_rate_limited(&message) => ErrorKind::RateLimited,
            _ => ErrorKind::Rejected,
        };

        Self {
            kind,
            message,
            status: Some(status),
            errors,
            is_retryable: is_retryable_status(status),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// True for a 429 or for any response whose message reads like a rate limit.
    pub fn is_rate_limit(&self) -> bool {
        self.kind == ErrorKind::RateLimited || looks_rate_limited(&self.message)
    }
}

/// Default retryable set: request-timeout, too-many-requests and the 5xx family.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

pub fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("too many requests")
}

fn default_message(status: u16) -> String {
    match StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
    {
        Some(reason) => format!("Request failed with status {status} ({reason})"),
        None => format!("Request failed with status {status}"),
    }
}

/// Accepts `{message}`, `{error: "..."}` and `{error: {message}}` bodies.
fn extract_message(body: &Value) -> Option<String> {
    if let Some(msg) = body.get("message").and_then(Value::as_str) {
        return Some(msg.to_string());
    }
    match body.get("error") {
        Some(Value::String(msg)) => Some(msg.clone()),
        Some(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        None => None,
    }
}

fn extract_field_errors(body: &Value) -> Vec<FieldError> {
    let Some(items) = body.get("errors").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(msg) => Some(FieldError {
                field: None,
                message: msg.clone(),
            }),
            Value::Object(_) => {
                let message = item
                    .get("message")
                    .or_else(|| item.get("msg"))
                    .and_then(Value::as_str)?
                    .to_string();
                let field = item
                    .get("field")
                    .or_else(|| item.get("path"))
                    .or_else(|| item.get("param"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(FieldError { field, message })
            }
            _ => None,
        })
        .collect()
}

/// Failures of the key-value storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
