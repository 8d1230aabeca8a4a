use std::time::Duration;

/// Broadcast by the request client so unrelated parts of the application can
/// react (toasts, redirects) without the client depending on them.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// 503: the feature is not configured on this deployment.
    ServiceUnavailable { url: String, message: String },
    /// Token refresh failed; credentials are gone and the user must sign in.
    SessionExpired { login_path: String },
    SignedIn,
    SignedOut,
}
