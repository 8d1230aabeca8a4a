//! Long-lived event channels with a polling fallback.
//!
//! A subscription runs one reader task that frames the response body into
//! events and hands them to a [`StreamObserver`] in byte order. If the channel
//! cannot be opened, or breaks after opening, the subscription degrades to
//! interval polling through the fallback fetch and remembers the failure for
//! the rest of the session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use reqwest::Method;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::transport::{ByteStream, HttpRequest, StreamConnector};
use crate::client::RequestClient;
use crate::errors::{ApiError, ErrorKind};

pub mod parser;
pub mod poller;

pub use parser::{SseFrame, SseParser, StreamEvent};
pub use poller::{PollFn, Poller};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(180);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Receives a subscription's events. Every method has a no-op default so
/// observers only implement what they care about.
pub trait StreamObserver: Send + Sync + 'static {
    fn on_message(&self, _event: &str, _payload: Value) {}
    fn on_progress(&self, _progress: u8, _message: Option<&str>) {}
    fn on_complete(&self, _payload: Value) {}
    fn on_error(&self, _error: &ApiError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    DegradedPolling,
    Closed,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    /// Suspend fallback polling after this long without `record_activity`.
    pub idle_timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            idle_timeout: None,
        }
    }
}

/// How to open one subscription.
#[derive(Clone)]
pub struct StreamRequest {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Continuous subscription: reconnect once after a normal completion.
    pub reconnect: bool,
    pub fallback: Option<PollFn>,
}

impl StreamRequest {
    /// Read-only subscription.
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: Vec::new(),
            reconnect: false,
            fallback: None,
        }
    }

    /// Request-with-body subscription, e.g. kicking off a generation job.
    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn reconnecting(mut self) -> Self {
        self.reconnect = true;
        self
    }

    pub fn with_fallback(mut self, fallback: PollFn) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Subscription {
    url: String,
    request: HttpRequest,
    reconnect: bool,
    observer: Arc<dyn StreamObserver>,
    poller: Option<Poller>,
    state: Mutex<StreamState>,
    /// Set by `close()`; checked before every callback.
    closed: AtomicBool,
    /// Set once `on_error` has fired.
    failed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.failed.load(Ordering::SeqCst)
    }

    fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    fn set_state(&self, next: StreamState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("Stream {}: {:?} -> {:?}", self.url, *state, next);
            *state = next;
        }
    }
}

/// Handle returned by [`StreamTransport::open_stream`].
#[derive(Clone)]
pub struct StreamHandle {
    subscription: Arc<Subscription>,
}

impl StreamHandle {
    pub fn state(&self) -> StreamState {
        self.subscription.state()
    }

    pub fn is_polling(&self) -> bool {
        self.subscription
            .poller
            .as_ref()
            .is_some_and(Poller::is_polling)
    }

    /// Forwards user activity to the fallback poller's inactivity timer.
    pub fn record_activity(&self) {
        if let Some(poller) = &self.subscription.poller {
            poller.record_activity();
        }
    }

    /// Aborts the network read, cancels every timer and silences callbacks.
    /// Calling it again does nothing.
    pub fn close(&self) {
        let sub = &self.subscription;
        if sub.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = lock(&sub.reader).take() {
            reader.abort();
        }
        if let Some(timer) = lock(&sub.reconnect_timer).take() {
            timer.abort();
        }
        if let Some(poller) = &sub.poller {
            poller.stop();
        }
        sub.set_state(StreamState::Closed);
        debug!("Stream {} closed", sub.url);
    }
}

#[derive(Clone)]
pub struct StreamTransport {
    connector: Arc<dyn StreamConnector>,
    client: RequestClient,
    options: StreamOptions,
    /// URLs whose stream failed this session; they go straight to polling.
    failed_urls: Arc<Mutex<HashSet<String>>>,
}

impl StreamTransport {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        client: RequestClient,
        options: StreamOptions,
    ) -> Self {
        Self {
            connector,
            client,
            options,
            failed_urls: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn has_failed(&self, url: &str) -> bool {
        lock(&self.failed_urls).contains(&self.client.resolve(url))
    }

    pub fn open_stream(
        &self,
        url: &str,
        request: StreamRequest,
        observer: Arc<dyn StreamObserver>,
    ) -> StreamHandle {
        let url = self.client.resolve(url);
        let poller = request.fallback.map(|fetch| {
            let poller = Poller::new(fetch, self.options.poll_interval);
            match self.options.idle_timeout {
                Some(idle) => poller.with_idle_timeout(idle),
                None => poller,
            }
        });

        let subscription = Arc::new(Subscription {
            url: url.clone(),
            request: HttpRequest {
                method: request.method,
                url: url.clone(),
                headers: request.headers,
                query: Vec::new(),
                body: request.body,
            },
            reconnect: request.reconnect,
            observer,
            poller,
            state: Mutex::new(StreamState::Connecting),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            reader: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
        });
        let handle = StreamHandle {
            subscription: subscription.clone(),
        };

        if let Some(poller) = &subscription.poller {
            if lock(&self.failed_urls).contains(&url) {
                info!("Stream {url} failed earlier this session; polling instead");
                subscription.set_state(StreamState::DegradedPolling);
                poller.start();
                return handle;
            }
        }

        let reader = tokio::spawn(self.clone().read(subscription.clone()));
        *lock(&subscription.reader) = Some(reader);
        handle
    }

    /// One-shot POST stream for long-running generation jobs: progress and
    /// completion callbacks, no reconnect, no polling.
    pub fn open_generation(
        &self,
        path: &str,
        body: Value,
        observer: Arc<dyn StreamObserver>,
    ) -> StreamHandle {
        self.open_stream(path, StreamRequest::post(body), observer)
    }

    // Boxed so the reconnect timer can spawn it without a recursive future type.
    fn read(self, sub: Arc<Subscription>) -> BoxFuture<'static, ()> {
        async move { self.run(sub).await }.boxed()
    }

    async fn run(&self, sub: Arc<Subscription>) {
        sub.set_state(StreamState::Connecting);

        let mut body = match self.connect(&sub.request).await {
            Ok(body) => body,
            Err(error) => {
                self.fail(&sub, error);
                return;
            }
        };

        let mut parser = SseParser::new();
        while let Some(chunk) = body.next().await {
            if !sub.is_live() {
                return;
            }
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(error) => {
                    self.fail(&sub, error);
                    return;
                }
            };
            for frame in parser.feed(&bytes) {
                if let Flow::Stop = self.dispatch(&sub, frame) {
                    return;
                }
            }
        }

        if let Some(frame) = parser.finish() {
            if let Flow::Stop = self.dispatch(&sub, frame) {
                return;
            }
        }
        self.complete(&sub, Value::Null);
    }

    async fn connect(&self, template: &HttpRequest) -> Result<ByteStream, ApiError> {
        let mut request = template.clone();
        if let Some(token) = self.client.bearer_token() {
            request.set_bearer(&token);
        }

        match self.connect_once(request.clone()).await {
            Err(error) if error.kind == ErrorKind::AuthExpired => {
                debug!("Stream {} rejected token; refreshing", request.url);
                let token = self.client.refresh_session().await?;
                request.set_bearer(&token);
                self.connect_once(request).await
            }
            other => other,
        }
    }

    async fn connect_once(&self, request: HttpRequest) -> Result<ByteStream, ApiError> {
        let timeout = self.client.options().timeout;
        match tokio::time::timeout(timeout, self.connector.connect(request)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::timeout(timeout)),
        }
    }

    fn dispatch(&self, sub: &Arc<Subscription>, frame: SseFrame) -> Flow {
        if !sub.is_live() {
            return Flow::Stop;
        }

        let event = match frame.into_event() {
            Ok(event) => event,
            Err(error) => {
                self.fail(sub, error);
                return Flow::Stop;
            }
        };

        if sub.state() == StreamState::Connecting {
            sub.set_state(StreamState::Open);
            info!("Stream {} open", sub.url);
        }

        match event {
            StreamEvent::Progress { progress, message } => {
                sub.observer.on_progress(progress, message.as_deref());
            }
            StreamEvent::Message { event, payload } => {
                sub.observer.on_message(&event, payload);
            }
            StreamEvent::Complete(payload) => {
                self.complete(sub, payload);
                return Flow::Stop;
            }
            StreamEvent::Error(message) => {
                self.fail(sub, ApiError::stream(message));
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Normal end: `on_complete`, then at most one pending reconnect for
    /// continuous subscriptions.
    fn complete(&self, sub: &Arc<Subscription>, payload: Value) {
        if !sub.is_live() {
            return;
        }
        sub.observer.on_complete(payload);
        sub.set_state(StreamState::Closed);

        if sub.reconnect {
            self.schedule_reconnect(sub);
        }
    }

    fn schedule_reconnect(&self, sub: &Arc<Subscription>) {
        let delay = self.options.reconnect_delay;
        debug!("Stream {} completed; reconnecting in {}s", sub.url, delay.as_secs());

        let transport = self.clone();
        let target = sub.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if target.is_live() {
                transport.read(target).await;
            }
        });

        // Replacing detaches the finishing task that scheduled this one.
        *lock(&sub.reconnect_timer) = Some(timer);
        if sub.closed.load(Ordering::SeqCst) {
            if let Some(timer) = lock(&sub.reconnect_timer).take() {
                timer.abort();
            }
        }
    }

    fn fail(&self, sub: &Arc<Subscription>, error: ApiError) {
        if !sub.is_live() {
            return;
        }
        sub.failed.store(true, Ordering::SeqCst);
        warn!("Stream {} failed: {}", sub.url, error);
        sub.observer.on_error(&error);

        let Some(poller) = &sub.poller else {
            sub.set_state(StreamState::Closed);
            return;
        };

        // A server-reported error is not a broken channel; only transport
        // and framing failures make the subscription poll-only.
        if error.kind != ErrorKind::Stream {
            lock(&self.failed_urls).insert(sub.url.clone());
        }
        sub.set_state(StreamState::DegradedPolling);
        poller.start();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
