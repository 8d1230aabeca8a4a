use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
    /// Shown distinctly from ordinary errors: the user only has to wait.
    RateLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now", alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Notification {
    /// A client-side notice. Its `local-` id never matches a server id.
    pub fn local(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: format!("local-{}", Uuid::new_v4()),
            kind,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
            read: false,
            metadata: None,
        }
    }
}

/// Body of `GET /notifications`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub total: Option<usize>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub page: u32,
    pub limit: u32,
    /// Extend the list instead of replacing it.
    pub append: bool,
    pub unread_only: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            append: false,
            unread_only: false,
        }
    }
}

impl FetchOptions {
    pub fn page(page: u32) -> Self {
        Self {
            page,
            append: page > 1,
            ..Self::default()
        }
    }
}

/// Decides whether an id was issued by the server.
pub type IdPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Server ids are 24-character hex object ids.
pub fn is_object_id(id: &str) -> bool {
    id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit())
}
