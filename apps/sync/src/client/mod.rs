//! The single point of entry for backend HTTP calls.
//!
//! Every call carries the stored bearer token. Identical concurrent calls share
//! one network request. Successful reads are cached for a short TTL. A 401
//! triggers one single-flight token refresh, shared by every caller that hits
//! it, followed by exactly one re-issue of the original call.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{ApiError, StorageError};
use crate::storage::Storage;

pub mod events;
pub mod retry;
pub mod transport;

pub use events::ClientEvent;
pub use retry::{with_retry, with_retry_notify, RetryOptions, RetryOutcome, RetryQueue};
pub use transport::{ApiResponse, HttpRequest, HttpTransport, ReqwestTransport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Prefix for relative URLs, e.g. `https://app.example.com/api/v1`.
    pub base_url: String,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub refresh_path: String,
    /// Where the UI should send the user after a forced sign-out.
    pub login_path: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            timeout: DEFAULT_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_path: "/auth/refresh".to_string(),
            login_path: "/login".to_string(),
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    pub skip_cache: bool,
    pub params: BTreeMap<String, String>,
    /// Body for methods that take one through config (e.g. DELETE with payload).
    pub data: Option<Value>,
}

impl RequestConfig {
    pub fn skip_cache() -> Self {
        Self {
            skip_cache: true,
            ..Self::default()
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

type SharedResponse = Shared<BoxFuture<'static, Result<ApiResponse, ApiError>>>;
type RefreshTicket = Shared<BoxFuture<'static, Result<String, ApiError>>>;

/// Shared work tagged with the session generation that started it.
struct InFlight<T> {
    generation: u64,
    handle: T,
}

struct CacheEntry {
    response: ApiResponse,
    stored_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: String,
    #[serde(default, alias = "expires_at")]
    expires_at: Option<DateTime<Utc>>,
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    storage: Storage,
    options: ClientOptions,
    cache: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight<SharedResponse>>>,
    refresh: Mutex<Option<InFlight<RefreshTicket>>>,
    /// Bumped by every teardown; work started under an older value must not
    /// write back.
    generation: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
}

/// Cheap to clone; clones share the cache, the in-flight table and the
/// refresh ticket. Independent instances share nothing.
#[derive(Clone)]
pub struct RequestClient {
    inner: Arc<Inner>,
}

impl RequestClient {
    pub fn new(transport: Arc<dyn HttpTransport>, storage: Storage, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                storage,
                options,
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                refresh: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.inner.storage.token()
    }

    /// Absolute URLs pass through; relative paths are joined onto the base URL.
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        let base = self.inner.options.base_url.trim_end_matches('/');
        if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/{url}")
        }
    }

    // ── Verbs ──────────────────────────────────────────────────────────────

    pub async fn get(&self, url: &str, config: RequestConfig) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, url, None, config).await
    }

    pub async fn post(&self, url: &str, body: Value) -> Result<ApiResponse, ApiError> {
        self.request(Method::POST, url, Some(body), RequestConfig::default())
            .await
    }

    pub async fn put(&self, url: &str, body: Value) -> Result<ApiResponse, ApiError> {
        self.request(Method::PUT, url, Some(body), RequestConfig::default())
            .await
    }

    pub async fn patch(&self, url: &str, body: Option<Value>) -> Result<ApiResponse, ApiError> {
        self.request(Method::PATCH, url, body, RequestConfig::default())
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<ApiResponse, ApiError> {
        self.request(Method::DELETE, url, None, RequestConfig::default())
            .await
    }

    /// Issues a call through the dedup/cache layer.
    ///
    /// GET is deduplicated and cached; everything else is deduplicated only.
    /// Callers that join an in-flight call receive its settled outcome.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        config: RequestConfig,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.resolve(url);
        let body = body.or(config.data);
        let cacheable = method == Method::GET && !config.skip_cache;
        let key = request_key(&method, &url, &config.params, body.as_ref());

        if cacheable {
            if let Some(hit) = self.cached(&key) {
                debug!("Cache hit: {key}");
                return Ok(hit);
            }
        }

        let handle = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight request: {key}");
                    existing.handle.clone()
                }
                None => {
                    let request = HttpRequest {
                        method,
                        url,
                        headers: Vec::new(),
                        query: config.params.into_iter().collect(),
                        body,
                    };
                    let client = self.clone();
                    let settle_key = key.clone();
                    let generation = self.generation();
                    let handle = async move {
                        let result = client.dispatch(request).await;
                        client.settle(&settle_key, generation, &result, cacheable);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(
                        key,
                        InFlight {
                            generation,
                            handle: handle.clone(),
                        },
                    );
                    handle
                }
            }
        };

        handle.await
    }

    // ── Cache ──────────────────────────────────────────────────────────────

    fn cached(&self, key: &str) -> Option<ApiResponse> {
        let mut cache = lock(&self.inner.cache);
        let fresh = cache
            .get(key)
            .map(|entry| entry.stored_at.elapsed() < self.inner.options.cache_ttl)?;
        if fresh {
            cache.get(key).map(|entry| entry.response.clone())
        } else {
            cache.remove(key);
            None
        }
    }

    /// Runs once per dispatched call, from inside the shared future. A call
    /// that outlived a teardown leaves the table and the cache alone.
    fn settle(
        &self,
        key: &str,
        generation: u64,
        result: &Result<ApiResponse, ApiError>,
        cacheable: bool,
    ) {
        if generation != self.generation() {
            debug!("Dropping outcome of {key} from an ended session");
            return;
        }
        {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight.get(key).map(|entry| entry.generation) == Some(generation) {
                in_flight.remove(key);
            }
        }
        if let (Ok(response), true) = (result, cacheable) {
            lock(&self.inner.cache).insert(
                key.to_string(),
                CacheEntry {
                    response: response.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
    }

    /// Drops every cached entry whose key contains `pattern`.
    pub fn invalidate(&self, pattern: &str) {
        let mut cache = lock(&self.inner.cache);
        let before = cache.len();
        cache.retain(|key, _| !key.contains(pattern));
        debug!("Invalidated {} cache entries matching '{pattern}'", before - cache.len());
    }

    pub fn clear_cache(&self) {
        lock(&self.inner.cache).clear();
    }

    /// Forgets cached and in-flight state and starts a new session
    /// generation. Callers still awaiting an in-flight call keep their handle
    /// and receive its outcome, but that outcome is no longer cached and a
    /// refresh that lands afterwards is not persisted.
    pub fn dispose(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.clear_cache();
        lock(&self.inner.in_flight).clear();
        *lock(&self.inner.refresh) = None;
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    // ── Dispatch ───────────────────────────────────────────────────────────

    async fn dispatch(&self, request: HttpRequest) -> Result<ApiResponse, ApiError> {
        let token = self.inner.storage.token();
        let response = self.send_once(&request, token.as_deref()).await?;

        if response.status == 401 && !self.is_refresh_call(&request) {
            debug!("401 from {}; refreshing session", request.url);
            let token = self.refresh_session().await?;
            let retried = self.send_once(&request, Some(&token)).await?;
            return self.into_result(&request, retried);
        }

        self.into_result(&request, response)
    }

    async fn send_once(
        &self,
        request: &HttpRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let mut request = request.clone();
        if let Some(token) = token {
            request.set_bearer(token);
        }

        let timeout = self.inner.options.timeout;
        match tokio::time::timeout(timeout, self.inner.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::timeout(timeout)),
        }
    }

    fn into_result(
        &self,
        request: &HttpRequest,
        response: ApiResponse,
    ) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            return Ok(response);
        }

        let error = ApiError::from_response(response.status, &response.body);
        if error.is_rate_limit() {
            warn!("Rate limited on {}: {}", request.url, error.message);
            self.broadcast(ClientEvent::RateLimited {
                message: error.message.clone(),
                retry_after: response.retry_after,
            });
        } else if response.status == 503 {
            info!("Service unavailable on {}: {}", request.url, error.message);
            self.broadcast(ClientEvent::ServiceUnavailable {
                url: request.url.clone(),
                message: error.message.clone(),
            });
        }
        Err(error)
    }

    fn is_refresh_call(&self, request: &HttpRequest) -> bool {
        request.url == self.resolve(&self.inner.options.refresh_path)
    }

    fn broadcast(&self, event: ClientEvent) {
        // No receivers is fine: nobody is listening for toasts yet.
        let _ = self.inner.events.send(event);
    }

    // ── Session ────────────────────────────────────────────────────────────

    /// Returns a fresh token, joining the refresh already in progress if any.
    ///
    /// On failure the stored credentials are cleared and `SessionExpired` is
    /// broadcast; the next 401 may start a new refresh.
    pub async fn refresh_session(&self) -> Result<String, ApiError> {
        let ticket = {
            let mut slot = lock(&self.inner.refresh);
            match slot.as_ref() {
                Some(ticket) => ticket.handle.clone(),
                None => {
                    let client = self.clone();
                    let generation = self.generation();
                    let ticket = async move {
                        let result = client.perform_refresh(generation).await;
                        {
                            let mut slot = lock(&client.inner.refresh);
                            if slot.as_ref().map(|t| t.generation) == Some(generation) {
                                *slot = None;
                            }
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        generation,
                        handle: ticket.clone(),
                    });
                    ticket
                }
            }
        };

        ticket.await
    }

    async fn perform_refresh(&self, generation: u64) -> Result<String, ApiError> {
        info!("Refreshing access token");
        let url = self.resolve(&self.inner.options.refresh_path);
        let request = HttpRequest::new(Method::POST, url);
        let current = self.inner.storage.token();

        let outcome = match self.send_once(&request, current.as_deref()).await {
            Ok(response) if response.is_success() => {
                serde_json::from_value::<RefreshResponse>(response.body)
                    .map_err(|e| ApiError::malformed(format!("Malformed refresh response: {e}")))
            }
            Ok(response) => Err(ApiError::from_response(response.status, &response.body)),
            Err(e) => Err(e),
        };

        if generation != self.generation() {
            info!("Session ended while refreshing; discarding the result");
            return Err(ApiError::from_response(
                401,
                &json!({ "message": "Signed out during token refresh" }),
            ));
        }

        match outcome {
            Ok(refreshed) => {
                if let Err(e) = self
                    .inner
                    .storage
                    .store_token(&refreshed.token, refreshed.expires_at)
                {
                    warn!("Refreshed token could not be persisted: {e}");
                }
                info!("Access token refreshed");
                Ok(refreshed.token)
            }
            Err(e) => {
                warn!("Token refresh failed ({e}); forcing sign-out");
                self.force_sign_out();
                Err(ApiError::from_response(
                    401,
                    &json!({ "message": "Session expired, please sign in again" }),
                ))
            }
        }
    }

    fn force_sign_out(&self) {
        self.inner.storage.clear_credentials();
        self.clear_cache();
        self.broadcast(ClientEvent::SessionExpired {
            login_path: self.inner.options.login_path.clone(),
        });
    }

    pub fn sign_in(
        &self,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
        remember: bool,
    ) -> Result<(), StorageError> {
        self.inner
            .storage
            .store_credentials(token, expires_at, remember)?;
        self.dispose();
        info!("Signed in (remember={remember})");
        self.broadcast(ClientEvent::SignedIn);
        Ok(())
    }

    pub fn sign_out(&self) {
        self.inner.storage.clear_credentials();
        self.dispose();
        info!("Signed out");
        self.broadcast(ClientEvent::SignedOut);
    }
}

/// `method:url:params:body`, with params in sorted order.
fn request_key(
    method: &Method,
    url: &str,
    params: &BTreeMap<String, String>,
    body: Option<&Value>,
) -> String {
    let params = serde_json::to_string(params).unwrap_or_default();
    let body = body.map(Value::to_string).unwrap_or_default();
    format!("{method}:{url}:{params}:{body}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;
    use crate::errors::ErrorKind;
    use futures::future::join_all;

    fn client_with(transport: Arc<FakeTransport>) -> RequestClient {
        RequestClient::new(transport, Storage::in_memory(), ClientOptions::default())
    }

    #[test]
    fn test_request_key_is_param_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("page".to_string(), "1".to_string());
        a.insert("limit".to_string(), "20".to_string());
        let mut b = BTreeMap::new();
        b.insert("limit".to_string(), "20".to_string());
        b.insert("page".to_string(), "1".to_string());
        assert_eq!(
            request_key(&Method::GET, "/n", &a, None),
            request_key(&Method::GET, "/n", &b, None)
        );
        assert_ne!(
            request_key(&Method::GET, "/n", &a, None),
            request_key(&Method::POST, "/n", &a, None)
        );
    }

    #[test]
    fn test_resolve_joins_relative_paths() {
        let client = client_with(Arc::new(FakeTransport::ok(Value::Null)));
        assert_eq!(
            client.resolve("/notifications"),
            "http://localhost:8080/api/v1/notifications"
        );
        assert_eq!(
            client.resolve("notifications"),
            "http://localhost:8080/api/v1/notifications"
        );
        assert_eq!(client.resolve("https://x.test/a"), "https://x.test/a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_reads_share_one_call() {
        let transport = Arc::new(
            FakeTransport::ok(json!({"items": [1, 2, 3]})).with_delay(Duration::from_millis(50)),
        );
        let client = client_with(transport.clone());

        let calls = (0..8).map(|_| client.get("/resumes", RequestConfig::default()));
        let results = join_all(calls).await;

        assert_eq!(transport.call_count(), 1);
        for result in results {
            assert_eq!(result.unwrap().body, json!({"items": [1, 2, 3]}));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_writes_are_deduplicated_but_not_cached() {
        let transport =
            Arc::new(FakeTransport::ok(json!({"ok": true})).with_delay(Duration::from_millis(10)));
        let client = client_with(transport.clone());

        let (a, b) = tokio::join!(
            client.post("/resumes", json!({"title": "A"})),
            client.post("/resumes", json!({"title": "A"}))
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(transport.call_count(), 1);

        client.post("/resumes", json!({"title": "A"})).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_expires_at_ttl() {
        let transport = Arc::new(FakeTransport::ok(json!({"v": 1})));
        let client = client_with(transport.clone());

        client.get("/profile", RequestConfig::default()).await.unwrap();
        client.get("/profile", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        client.get("/profile", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        client.get("/profile", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_skip_cache_always_hits_network() {
        let transport = Arc::new(FakeTransport::ok(json!({})));
        let client = client_with(transport.clone());

        client.get("/profile", RequestConfig::skip_cache()).await.unwrap();
        client.get("/profile", RequestConfig::skip_cache()).await.unwrap();
        client.get("/profile", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_reads_are_not_cached() {
        let transport = Arc::new(FakeTransport::ok(json!({"ok": true})));
        transport.push(Ok(ApiResponse::new(500, json!({"message": "boom"}))));
        let client = client_with(transport.clone());

        let err = client
            .get("/profile", RequestConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerFault);
        assert!(err.is_retryable);

        let ok = client.get("/profile", RequestConfig::default()).await.unwrap();
        assert_eq!(ok.body, json!({"ok": true}));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_by_substring() {
        let transport = Arc::new(FakeTransport::ok(json!({})));
        let client = client_with(transport.clone());

        client.get("/notifications", RequestConfig::default()).await.unwrap();
        client.get("/resumes", RequestConfig::default()).await.unwrap();
        client.invalidate("/notifications");
        client.get("/notifications", RequestConfig::default()).await.unwrap();
        client.get("/resumes", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 3);

        client.clear_cache();
        client.get("/resumes", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn test_bearer_token_is_attached() {
        let transport = Arc::new(FakeTransport::ok(json!({})));
        let client = client_with(transport.clone());
        client.sign_in("abc123", None, false).unwrap();

        client.get("/me", RequestConfig::default()).await.unwrap();
        let requests = lock(&transport.requests);
        assert_eq!(requests[0].header("Authorization"), Some("Bearer abc123"));
    }

    fn refreshing_transport() -> FakeTransport {
        FakeTransport::new(|request| {
            if request.url.ends_with("/auth/refresh") {
                return Ok(ApiResponse::new(200, json!({"token": "fresh"})));
            }
            match request.header("Authorization") {
                Some("Bearer fresh") => Ok(ApiResponse::new(200, json!({"url": request.url}))),
                _ => Ok(ApiResponse::new(401, json!({"message": "jwt expired"}))),
            }
        })
        .with_delay(Duration::from_millis(20))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_trigger_one_refresh() {
        let transport = Arc::new(refreshing_transport());
        let client = client_with(transport.clone());
        client.sign_in("stale", None, true).unwrap();

        let urls = ["/a", "/b", "/c", "/d", "/e"];
        let results = join_all(
            urls.iter()
                .map(|url| client.get(url, RequestConfig::default())),
        )
        .await;

        for result in results {
            assert!(result.is_ok(), "{result:?}");
        }
        assert_eq!(transport.requests_to(Method::POST, "/auth/refresh"), 1);
        assert_eq!(client.bearer_token().as_deref(), Some("fresh"));
        // Remembered sessions keep the refreshed token in durable storage.
        assert!(client.storage().remember_me());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_forces_sign_out() {
        let transport = Arc::new(FakeTransport::new(|request| {
            if request.url.ends_with("/auth/refresh") {
                Ok(ApiResponse::new(401, json!({"message": "refresh token revoked"})))
            } else {
                Ok(ApiResponse::new(401, json!({"message": "jwt expired"})))
            }
        }));
        let client = client_with(transport.clone());
        client.sign_in("stale", None, false).unwrap();
        let mut events = client.subscribe();

        let err = client
            .get("/me", RequestConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(client.bearer_token(), None);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::SessionExpired {
                login_path: "/login".to_string()
            }
        );
        assert_eq!(transport.requests_to(Method::POST, "/auth/refresh"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_refresh_keeps_token_cleared() {
        let transport = Arc::new(refreshing_transport());
        let client = client_with(transport.clone());
        client.sign_in("stale", None, true).unwrap();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.get("/me", RequestConfig::default()).await }
        });
        // The 401 lands at 20ms and the refresh answers at 40ms.
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.sign_out();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(client.bearer_token(), None);
        assert_eq!(transport.requests_to(Method::POST, "/auth/refresh"), 1);

        // The next session refreshes on its own.
        client.sign_in("stale-again", None, false).unwrap();
        client.get("/me", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.requests_to(Method::POST, "/auth/refresh"), 2);
        assert_eq!(client.bearer_token().as_deref(), Some("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_read_does_not_cache_old_session() {
        let transport = Arc::new(
            FakeTransport::ok(json!({"email": "a@b.c"})).with_delay(Duration::from_millis(50)),
        );
        let client = client_with(transport.clone());
        client.sign_in("abc", None, false).unwrap();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.get("/me", RequestConfig::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.sign_out();

        // The caller that started the read still gets its answer.
        assert!(pending.await.unwrap().is_ok());

        client.get("/me", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_settle_leaves_newer_in_flight_entry() {
        let transport =
            Arc::new(FakeTransport::ok(json!({"v": 1})).with_delay(Duration::from_millis(50)));
        let client = client_with(transport.clone());

        let old = tokio::spawn({
            let client = client.clone();
            async move { client.get("/profile", RequestConfig::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.dispose();

        // Started at 10ms, still running when the old call settles at 50ms.
        let newer = tokio::spawn({
            let client = client.clone();
            async move { client.get("/profile", RequestConfig::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(old.await.unwrap().is_ok());

        // Joins the newer call instead of dispatching a third.
        let joined = client.get("/profile", RequestConfig::default()).await;
        assert!(joined.is_ok());
        assert!(newer.await.unwrap().is_ok());
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_refresh_body_ends_session() {
        let transport = Arc::new(FakeTransport::new(|request| {
            if request.url.ends_with("/auth/refresh") {
                Ok(ApiResponse::new(200, json!({"unexpected": true})))
            } else {
                Ok(ApiResponse::new(401, json!({"message": "jwt expired"})))
            }
        }));
        let client = client_with(transport);
        client.sign_in("stale", None, false).unwrap();

        let err = client.refresh_session().await.unwrap_err();
        // A refresh that cannot be used ends the session.
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(client.bearer_token(), None);
    }

    #[tokio::test]
    async fn test_rate_limit_is_broadcast() {
        let transport = Arc::new(FakeTransport::new(|_| {
            let mut response = ApiResponse::new(429, json!({"message": "Too many requests"}));
            response.retry_after = Some(Duration::from_secs(12));
            Ok(response)
        }));
        let client = client_with(transport);
        let mut events = client.subscribe();

        let err = client
            .get("/analysis", RequestConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::RateLimited {
                message: "Too many requests".to_string(),
                retry_after: Some(Duration::from_secs(12)),
            }
        );
    }

    #[tokio::test]
    async fn test_service_unavailable_is_broadcast() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(ApiResponse::new(503, json!({"message": "AI not configured"})))
        }));
        let client = client_with(transport);
        let mut events = client.subscribe();

        let err = client.post("/generate", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::ServiceUnavailable { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_retryable_network_failure() {
        let transport =
            Arc::new(FakeTransport::ok(json!({})).with_delay(Duration::from_secs(31)));
        let client = client_with(transport);

        let err = client
            .get("/slow", RequestConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.status, None);
        assert!(err.is_retryable);
    }

    #[tokio::test]
    async fn test_sign_out_clears_credentials_and_cache() {
        let transport = Arc::new(FakeTransport::ok(json!({})));
        let client = client_with(transport.clone());
        client.sign_in("abc", None, true).unwrap();
        client.get("/me", RequestConfig::default()).await.unwrap();
        let mut events = client.subscribe();

        client.sign_out();

        assert_eq!(client.bearer_token(), None);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::SignedOut);
        client.get("/me", RequestConfig::default()).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }
}
