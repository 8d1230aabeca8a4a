//! Optimistic notification state mirrored to the server.
//!
//! Mutations apply locally first and are rolled back if the server rejects
//! them. Only server-issued ids are sent to the server; local notices live
//! and die on the client.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ApiResponse, ClientEvent, RequestClient, RequestConfig};
use crate::errors::{ApiError, ErrorKind};
use crate::storage::CapabilityCache;
use crate::stream::{PollFn, StreamHandle, StreamObserver, StreamRequest, StreamTransport};

pub mod commands;
pub mod models;

pub use commands::{Command, Inverse, NotificationList};
pub use models::{
    is_object_id, FetchOptions, IdPredicate, Notification, NotificationKind, NotificationPage,
};

const SNAPSHOT_KEY: &str = "cache:notifications";
const CAPABILITY_ENDPOINT: &str = "notifications";

#[derive(Clone)]
pub struct StoreOptions {
    pub endpoint: String,
    pub max_notifications: usize,
    pub undo_depth: usize,
    /// Lifetime of the persisted list used by `hydrate`.
    pub snapshot_ttl: Duration,
    /// How long a "notifications endpoint missing" record suppresses fetches.
    pub capability_ttl: Duration,
    pub is_server_id: IdPredicate,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            endpoint: "/notifications".to_string(),
            max_notifications: 50,
            undo_depth: 5,
            snapshot_ttl: Duration::from_secs(5 * 60),
            capability_ttl: Duration::from_secs(60 * 60),
            is_server_id: Arc::new(is_object_id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    notifications: Vec<Notification>,
    total: usize,
}

struct UndoEntry {
    seq: u64,
    previous: NotificationList,
}

struct StoreState {
    list: NotificationList,
    undo: VecDeque<UndoEntry>,
    next_seq: u64,
    last_error: Option<ApiError>,
}

struct StoreInner {
    client: RequestClient,
    capability: CapabilityCache,
    options: StoreOptions,
    state: Mutex<StoreState>,
}

/// Cheap to clone; clones share one list.
#[derive(Clone)]
pub struct NotificationStore {
    inner: Arc<StoreInner>,
}

impl NotificationStore {
    pub fn new(client: RequestClient, options: StoreOptions) -> Self {
        let capability = CapabilityCache::new(client.storage().clone(), options.capability_ttl);
        let state = StoreState {
            list: NotificationList::new(options.max_notifications),
            undo: VecDeque::new(),
            next_seq: 0,
            last_error: None,
        };
        Self {
            inner: Arc::new(StoreInner {
                client,
                capability,
                options,
                state: Mutex::new(state),
            }),
        }
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().list.items.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.lock().list.unread_count()
    }

    pub fn total(&self) -> usize {
        self.lock().list.total
    }

    pub fn last_error(&self) -> Option<ApiError> {
        self.lock().last_error.clone()
    }

    pub fn can_undo(&self) -> bool {
        !self.lock().undo.is_empty()
    }

    pub fn is_server_id(&self, id: &str) -> bool {
        (self.inner.options.is_server_id)(id)
    }

    // ── Fetch ──────────────────────────────────────────────────────────────

    pub async fn fetch(&self, opts: FetchOptions) -> Result<(), ApiError> {
        let capability = &self.inner.capability;
        if capability.is_unavailable(CAPABILITY_ENDPOINT) {
            debug!("Notifications endpoint marked unavailable; keeping local list");
            return Ok(());
        }

        let mut config = RequestConfig::default()
            .param("page", opts.page)
            .param("limit", opts.limit);
        if opts.unread_only {
            config = config.param("unread", true);
        }

        let response = match self.inner.client.get(&self.inner.options.endpoint, config).await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => {
                info!("Notifications endpoint not found; disabling remote fetches");
                capability.mark(CAPABILITY_ENDPOINT, false);
                return Ok(());
            }
            Err(e) if e.kind == ErrorKind::ServiceUnavailable => {
                debug!("Notifications not configured on this deployment");
                return Ok(());
            }
            Err(e) => {
                warn!("Failed to fetch notifications: {e}");
                self.lock().last_error = Some(e.clone());
                return Err(e);
            }
        };

        let page = match parse_page(response) {
            Ok(page) => page,
            Err(e) => {
                warn!("{e}");
                self.lock().last_error = Some(e.clone());
                return Err(e);
            }
        };
        capability.mark(CAPABILITY_ENDPOINT, true);

        let snapshot = {
            let mut state = self.lock();
            if opts.append {
                state.list.extend(page.notifications, page.total);
            } else {
                let keep = self.local_only(&state.list);
                state.list.replace(page.notifications, page.total, keep);
            }
            state.last_error = None;
            Snapshot {
                notifications: state.list.items.clone(),
                total: state.list.total,
            }
        };

        if let Err(e) = self.inner.client.storage().set_blob(SNAPSHOT_KEY, &snapshot) {
            warn!("Failed to persist notification snapshot: {e}");
        }
        debug!(
            "Fetched notifications page {} ({} held, has_more={})",
            opts.page,
            snapshot.notifications.len(),
            page.has_more
        );
        Ok(())
    }

    /// Restores the persisted list if it is still fresh. Returns whether
    /// anything was restored.
    pub fn hydrate(&self) -> bool {
        let Some(snapshot) = self
            .inner
            .client
            .storage()
            .fresh_blob::<Snapshot>(SNAPSHOT_KEY, self.inner.options.snapshot_ttl)
        else {
            return false;
        };
        let mut state = self.lock();
        let keep = self.local_only(&state.list);
        state
            .list
            .replace(snapshot.notifications, Some(snapshot.total), keep);
        debug!("Hydrated {} notifications from storage", state.list.items.len());
        true
    }

    // ── Local transitions ──────────────────────────────────────────────────

    /// Prepends a notification. Duplicates are ignored.
    pub fn add(&self, notification: Notification) -> bool {
        self.lock().list.push_front(notification)
    }

    pub fn notify_local(
        &self,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Notification {
        let notification = Notification::local(kind, title, message);
        self.add(notification.clone());
        notification
    }

    /// Restores the list as it was before the last dismiss or clear-all.
    /// Remote calls are not reversed.
    pub fn undo(&self) -> bool {
        let mut state = self.lock();
        match state.undo.pop_back() {
            Some(entry) => {
                state.list = entry.previous;
                true
            }
            None => false,
        }
    }

    // ── Optimistic mutations ───────────────────────────────────────────────

    pub async fn mark_read(&self, id: &str) -> Result<(), ApiError> {
        let url = format!("{}/{id}/read", self.inner.options.endpoint);
        let client = self.inner.client.clone();
        self.run(Command::MarkRead(id.to_string()), false, async move {
            client.patch(&url, None).await
        })
        .await
    }

    pub async fn mark_all_read(&self) -> Result<(), ApiError> {
        let url = format!("{}/read-all", self.inner.options.endpoint);
        let client = self.inner.client.clone();
        self.run(Command::MarkAllRead, false, async move {
            client.patch(&url, None).await
        })
        .await
    }

    pub async fn dismiss(&self, id: &str) -> Result<(), ApiError> {
        let url = format!("{}/{id}", self.inner.options.endpoint);
        let client = self.inner.client.clone();
        self.run(Command::Dismiss(id.to_string()), true, async move {
            client.delete(&url).await
        })
        .await
    }

    pub async fn clear_all(&self) -> Result<(), ApiError> {
        let url = self.inner.options.endpoint.clone();
        let client = self.inner.client.clone();
        self.run(Command::ClearAll, true, async move { client.delete(&url).await })
            .await
    }

    /// Applies `command` locally, then mirrors it to the server if it touched
    /// any server-issued id. Server-wide commands also go out when the server
    /// holds entries that are not loaded, even if nothing changed locally.
    async fn run<F>(&self, command: Command, undoable: bool, remote: F) -> Result<(), ApiError>
    where
        F: Future<Output = Result<ApiResponse, ApiError>>,
    {
        let (inverse, undo_seq, server_wide) = {
            let mut state = self.lock();
            let previous = state.list.clone();
            let server_wide = command.is_server_wide() && self.server_holds_any(&state.list);
            let (inverse, undo_seq) = match command.apply(&mut state.list) {
                Some(inverse) => {
                    let seq = undoable.then(|| self.push_undo(&mut state, previous));
                    (inverse, seq)
                }
                None if server_wide => (Inverse::Unmark(Vec::new()), None),
                None => return Ok(()),
            };
            (inverse, undo_seq, server_wide)
        };

        let remote_ids = inverse
            .affected_ids()
            .into_iter()
            .any(|id| self.is_server_id(id));
        if !remote_ids && !server_wide {
            return Ok(());
        }

        match remote.await {
            Ok(_) => {
                self.inner.client.invalidate(&self.inner.options.endpoint);
                if let Err(e) = self.fetch(FetchOptions::default()).await {
                    warn!("Reconcile fetch after {command:?} failed: {e}");
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("{command:?}: already gone on the server");
                Ok(())
            }
            Err(e) => {
                warn!("{command:?} rejected by server ({e}); rolling back");
                let mut state = self.lock();
                inverse.revert(&mut state.list);
                if let Some(seq) = undo_seq {
                    state.undo.retain(|entry| entry.seq != seq);
                }
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn push_undo(&self, state: &mut StoreState, previous: NotificationList) -> u64 {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.undo.push_back(UndoEntry { seq, previous });
        while state.undo.len() > self.inner.options.undo_depth {
            state.undo.pop_front();
        }
        seq
    }

    /// True when a server id is loaded or `total` counts entries beyond the
    /// local-only ones.
    fn server_holds_any(&self, list: &NotificationList) -> bool {
        let local = list.items.iter().filter(|n| !self.is_server_id(&n.id)).count();
        list.total > local || list.items.iter().any(|n| self.is_server_id(&n.id))
    }

    fn local_only(&self, list: &NotificationList) -> Vec<Notification> {
        list.items
            .iter()
            .filter(|n| !self.is_server_id(&n.id))
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Wiring ─────────────────────────────────────────────────────────────

    /// Turns broadcast client failures into local notices until the sender
    /// goes away.
    pub fn watch_client_events(&self, mut events: broadcast::Receiver<ClientEvent>) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => store.on_client_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {skipped} client events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn on_client_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::RateLimited {
                message,
                retry_after,
            } => {
                let message = match retry_after {
                    Some(wait) => format!("{message} Try again in {}s.", wait.as_secs()),
                    None => message,
                };
                self.notify_local(NotificationKind::RateLimit, "Rate limit reached", message);
            }
            ClientEvent::ServiceUnavailable { message, .. } => {
                self.notify_local(NotificationKind::Warning, "Feature unavailable", message);
            }
            ClientEvent::SessionExpired { .. } => {
                self.notify_local(
                    NotificationKind::Error,
                    "Session expired",
                    "Please sign in again.",
                );
            }
            ClientEvent::SignedIn | ClientEvent::SignedOut => {}
        }
    }

    /// Opens the push channel with this store as observer and `fetch` as the
    /// polling fallback.
    pub fn subscribe(&self, transport: &StreamTransport) -> StreamHandle {
        let store = self.clone();
        let fallback: PollFn = Arc::new(move || {
            let store = store.clone();
            async move {
                if let Err(e) = store.fetch(FetchOptions::default()).await {
                    debug!("Polling fetch failed: {e}");
                }
            }
            .boxed()
        });

        let url = format!("{}/stream", self.inner.options.endpoint);
        transport.open_stream(
            &url,
            StreamRequest::get().reconnecting().with_fallback(fallback),
            Arc::new(self.clone()),
        )
    }

    fn replace_from_push(&self, payload: &Value) {
        let list = payload.get("notifications").cloned().unwrap_or(json!([]));
        let notifications: Vec<Notification> = match serde_json::from_value(list) {
            Ok(list) => list,
            Err(e) => {
                warn!("Ignoring malformed initial notifications: {e}");
                return;
            }
        };
        let total = payload
            .get("total")
            .and_then(Value::as_u64)
            .map(|t| t as usize);

        let mut state = self.lock();
        let keep = self.local_only(&state.list);
        state.list.replace(notifications, total, keep);
    }
}

impl StreamObserver for NotificationStore {
    fn on_message(&self, event: &str, payload: Value) {
        if matches!(event, "initial" | "notification") {
            // A cached page predates this push and would drop it on replace.
            self.inner.client.invalidate(&self.inner.options.endpoint);
        }
        match event {
            "initial" => self.replace_from_push(&payload),
            "notification" => {
                let body = payload.get("notification").cloned().unwrap_or(payload);
                match serde_json::from_value::<Notification>(body) {
                    Ok(notification) => {
                        self.add(notification);
                    }
                    Err(e) => warn!("Ignoring malformed pushed notification: {e}"),
                }
            }
            "connected" => info!("Notification stream connected"),
            other => debug!("Ignoring '{other}' event on notification stream"),
        }
    }

    fn on_error(&self, error: &ApiError) {
        warn!("Notification stream failed ({error}); polling takes over");
    }
}

fn parse_page(response: ApiResponse) -> Result<NotificationPage, ApiError> {
    serde_json::from_value(response.body)
        .map_err(|e| ApiError::malformed(format!("Malformed notifications response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakeTransport;
    use crate::client::{ClientOptions, HttpRequest};
    use crate::storage::Storage;
    use crate::stream::testing::{chunks, ScriptedConnector};
    use crate::stream::{StreamOptions, StreamState};
    use chrono::{Duration as ChronoDuration, Utc};
    use reqwest::Method;

    fn server_id(n: u32) -> String {
        format!("{n:024x}")
    }

    fn server_note(n: u32, minutes_ago: i64) -> Value {
        json!({
            "_id": server_id(n),
            "type": "info",
            "title": format!("Server {n}"),
            "message": "",
            "createdAt": (Utc::now() - ChronoDuration::minutes(minutes_ago)).to_rfc3339(),
            "read": false,
        })
    }

    fn note(id: &str) -> Notification {
        Notification {
            id: id.to_string(),
            kind: NotificationKind::Info,
            title: id.to_string(),
            message: String::new(),
            created_at: Utc::now(),
            read: false,
            metadata: None,
        }
    }

    fn store_with(transport: Arc<FakeTransport>, storage: Storage) -> NotificationStore {
        let client = RequestClient::new(transport, storage, ClientOptions::default());
        NotificationStore::new(client, StoreOptions::default())
    }

    fn store_over(
        responder: impl Fn(&HttpRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    ) -> (NotificationStore, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new(responder));
        (store_with(transport.clone(), Storage::in_memory()), transport)
    }

    fn page(items: Vec<Value>) -> ApiResponse {
        let total = items.len();
        ApiResponse::new(
            200,
            json!({ "notifications": items, "total": total, "hasMore": false }),
        )
    }

    fn ids(store: &NotificationStore) -> Vec<String> {
        store.notifications().into_iter().map(|n| n.id).collect()
    }

    #[tokio::test]
    async fn test_fetch_replaces_list_and_tracks_total() {
        let (store, transport) = store_over(|_| {
            Ok(ApiResponse::new(
                200,
                json!({
                    "notifications": [server_note(1, 0), server_note(2, 5)],
                    "total": 12,
                    "hasMore": true,
                }),
            ))
        });

        store.fetch(FetchOptions::default()).await.unwrap();

        assert_eq!(ids(&store), vec![server_id(1), server_id(2)]);
        assert_eq!(store.total(), 12);
        assert_eq!(store.unread_count(), 2);
        let requests = transport.requests.lock().unwrap();
        assert!(requests[0]
            .query
            .contains(&("limit".to_string(), "20".to_string())));
    }

    #[tokio::test]
    async fn test_fetch_append_skips_duplicates() {
        let (store, _) = store_over(|request| {
            let page_no = request
                .query
                .iter()
                .find(|(k, _)| k == "page")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            Ok(if page_no == "1" {
                page(vec![server_note(1, 0), server_note(2, 1)])
            } else {
                page(vec![server_note(2, 1), server_note(3, 2)])
            })
        });

        store.fetch(FetchOptions::default()).await.unwrap();
        store.fetch(FetchOptions::page(2)).await.unwrap();

        assert_eq!(ids(&store), vec![server_id(1), server_id(2), server_id(3)]);
    }

    #[tokio::test]
    async fn test_unread_only_sends_filter() {
        let (store, transport) = store_over(|_| Ok(page(vec![])));
        store
            .fetch(FetchOptions {
                unread_only: true,
                ..FetchOptions::default()
            })
            .await
            .unwrap();
        let requests = transport.requests.lock().unwrap();
        assert!(requests[0]
            .query
            .contains(&("unread".to_string(), "true".to_string())));
    }

    #[tokio::test]
    async fn test_add_prepends_and_caps_at_fifty() {
        let (store, transport) = store_over(|_| Ok(page(vec![])));
        for i in 0..55 {
            assert!(store.add(note(&format!("local-{i}"))));
        }
        assert!(!store.add(note("local-54")));

        let list = ids(&store);
        assert_eq!(list.len(), 50);
        assert_eq!(list[0], "local-54");
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dismiss_local_id_makes_no_remote_call() {
        let (store, transport) = store_over(|_| Ok(page(vec![])));
        let notice = store.notify_local(NotificationKind::Success, "Saved", "Resume saved");

        store.dismiss(&notice.id).await.unwrap();

        assert!(store.notifications().is_empty());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_dismiss_restores_exact_list() {
        let (store, transport) = store_over(|request| {
            if request.method == Method::DELETE {
                Ok(ApiResponse::new(500, json!({"message": "db down"})))
            } else {
                Ok(page(vec![server_note(1, 0), server_note(2, 1), server_note(3, 2)]))
            }
        });
        store.fetch(FetchOptions::default()).await.unwrap();
        let before = store.notifications();

        let err = store.dismiss(&server_id(2)).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ServerFault);
        assert_eq!(store.notifications(), before);
        assert_eq!(store.total(), 3);
        assert_eq!(store.last_error(), Some(err));
        assert!(!store.can_undo());
        assert_eq!(transport.requests_to(Method::DELETE, &server_id(2)), 1);
    }

    #[tokio::test]
    async fn test_successful_dismiss_reconciles_with_server() {
        let dismissed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = dismissed.clone();
        let (store, transport) = store_over(move |request| {
            if request.method == Method::DELETE {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                return Ok(ApiResponse::new(200, json!({"success": true})));
            }
            if flag.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(page(vec![server_note(1, 0)]))
            } else {
                Ok(page(vec![server_note(1, 0), server_note(2, 1)]))
            }
        });
        store.fetch(FetchOptions::default()).await.unwrap();

        store.dismiss(&server_id(2)).await.unwrap();

        assert_eq!(ids(&store), vec![server_id(1)]);
        // The cached first page was invalidated, so the reconcile hit the network.
        assert_eq!(transport.requests_to(Method::GET, "/notifications"), 2);
        assert!(store.can_undo());
    }

    #[tokio::test]
    async fn test_not_found_on_mutation_is_ignored() {
        let (store, _) = store_over(|request| {
            if request.method == Method::PATCH {
                Ok(ApiResponse::new(404, json!({"message": "Notification not found"})))
            } else {
                Ok(page(vec![server_note(1, 0)]))
            }
        });
        store.fetch(FetchOptions::default()).await.unwrap();

        store.mark_read(&server_id(1)).await.unwrap();

        assert_eq!(store.unread_count(), 0);
        assert!(store.last_error().is_none());
    }

    #[tokio::test]
    async fn test_failed_mark_read_rolls_back() {
        let (store, _) = store_over(|request| {
            if request.method == Method::PATCH {
                Err(ApiError::network("offline"))
            } else {
                Ok(page(vec![server_note(1, 0), server_note(2, 1)]))
            }
        });
        store.fetch(FetchOptions::default()).await.unwrap();

        let err = store.mark_read(&server_id(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(store.unread_count(), 2);
    }

    #[tokio::test]
    async fn test_mark_all_read_only_calls_server_for_server_ids() {
        let (store, transport) = store_over(|request| {
            if request.method == Method::PATCH {
                Ok(ApiResponse::new(200, json!({})))
            } else {
                Ok(page(vec![server_note(1, 0)]))
            }
        });
        store.notify_local(NotificationKind::Info, "a", "");
        store.notify_local(NotificationKind::Info, "b", "");
        store.mark_all_read().await.unwrap();
        assert_eq!(store.unread_count(), 0);
        assert_eq!(transport.call_count(), 0);

        store.fetch(FetchOptions::default()).await.unwrap();
        assert_eq!(store.unread_count(), 1);
        store.mark_all_read().await.unwrap();
        assert_eq!(transport.requests_to(Method::PATCH, "/notifications/read-all"), 1);
    }

    #[tokio::test]
    async fn test_mark_all_read_reaches_server_when_loaded_page_is_read() {
        let (store, transport) = store_over(|request| {
            if request.method == Method::PATCH {
                return Ok(ApiResponse::new(200, json!({})));
            }
            let mut read = server_note(1, 0);
            read["read"] = json!(true);
            Ok(ApiResponse::new(
                200,
                json!({ "notifications": [read], "total": 40, "hasMore": true }),
            ))
        });
        store.fetch(FetchOptions::default()).await.unwrap();
        assert_eq!(store.unread_count(), 0);
        assert_eq!(store.total(), 40);

        store.mark_all_read().await.unwrap();

        assert_eq!(transport.requests_to(Method::PATCH, "/notifications/read-all"), 1);
        assert!(store.last_error().is_none());
    }

    #[tokio::test]
    async fn test_clear_all_reaches_server_for_unloaded_entries() {
        let (store, transport) = store_over(|request| {
            if request.method == Method::DELETE {
                return Ok(ApiResponse::new(200, json!({"success": true})));
            }
            Ok(ApiResponse::new(
                200,
                json!({ "notifications": [], "total": 3, "hasMore": true }),
            ))
        });
        store.fetch(FetchOptions::default()).await.unwrap();
        store.add(note("local-1"));

        store.clear_all().await.unwrap();

        assert_eq!(transport.requests_to(Method::DELETE, "/notifications"), 1);
        assert!(!ids(&store).contains(&"local-1".to_string()));
    }

    #[tokio::test]
    async fn test_pushed_notification_survives_refetch() {
        let gets = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = gets.clone();
        let (store, transport) = store_over(move |_| {
            let seen = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(if seen == 0 {
                page(vec![server_note(1, 5)])
            } else {
                page(vec![server_note(2, 0), server_note(1, 5)])
            })
        });
        store.fetch(FetchOptions::default()).await.unwrap();

        store.on_message("notification", server_note(2, 0));
        store.fetch(FetchOptions::default()).await.unwrap();

        assert_eq!(transport.requests_to(Method::GET, "/notifications"), 2);
        assert_eq!(ids(&store), vec![server_id(2), server_id(1)]);
        assert_eq!(store.total(), 2);
    }

    #[tokio::test]
    async fn test_malformed_page_is_a_non_retryable_fault() {
        let (store, _) = store_over(|_| {
            Ok(ApiResponse::new(200, json!({"notifications": "not a list"})))
        });

        let err = store.fetch(FetchOptions::default()).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ServerFault);
        assert_eq!(err.status, None);
        assert!(!err.is_retryable);
        assert_eq!(store.last_error(), Some(err));
    }

    #[tokio::test]
    async fn test_clear_all_then_undo() {
        let (store, transport) = store_over(|_| Ok(page(vec![])));
        store.add(note("local-1"));
        store.add(note("local-2"));
        let before = store.notifications();

        store.clear_all().await.unwrap();
        assert!(store.notifications().is_empty());
        assert_eq!(store.unread_count(), 0);
        assert_eq!(transport.call_count(), 0);

        assert!(store.undo());
        assert_eq!(store.notifications(), before);
        assert!(!store.undo());
    }

    #[tokio::test]
    async fn test_failed_clear_all_restores_snapshot() {
        let (store, _) = store_over(|request| {
            if request.method == Method::DELETE {
                Ok(ApiResponse::new(403, json!({"message": "forbidden"})))
            } else {
                Ok(page(vec![server_note(1, 0), server_note(2, 1)]))
            }
        });
        store.fetch(FetchOptions::default()).await.unwrap();
        let before = store.notifications();

        let err = store.clear_all().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Rejected);
        assert_eq!(store.notifications(), before);
        assert_eq!(store.total(), 2);
    }

    #[tokio::test]
    async fn test_undo_depth_is_bounded() {
        let (store, _) = store_over(|_| Ok(page(vec![])));
        for i in 0..7 {
            store.add(note(&format!("local-{i}")));
        }
        for i in 0..7 {
            store.dismiss(&format!("local-{i}")).await.unwrap();
        }
        assert!(store.notifications().is_empty());

        let mut undone = 0;
        while store.undo() {
            undone += 1;
        }
        assert_eq!(undone, 5);
        // Back to the state after the first two dismissals.
        assert_eq!(store.notifications().len(), 5);
    }

    #[tokio::test]
    async fn test_missing_endpoint_disables_fetches_and_keeps_local() {
        let (store, transport) =
            store_over(|_| Ok(ApiResponse::new(404, json!({"message": "Cannot GET"}))));
        store.notify_local(NotificationKind::Info, "Welcome", "");

        store.fetch(FetchOptions::default()).await.unwrap();
        store.fetch(FetchOptions::default()).await.unwrap();

        assert_eq!(transport.call_count(), 1);
        assert_eq!(store.notifications().len(), 1);
        assert!(store.last_error().is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_feature_leaves_list() {
        let (store, _) = store_over(|_| {
            Ok(ApiResponse::new(503, json!({"message": "Notifications disabled"})))
        });
        store.add(note("local-1"));

        store.fetch(FetchOptions::default()).await.unwrap();

        assert_eq!(ids(&store), vec!["local-1".to_string()]);
        assert!(store.last_error().is_none());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_recorded() {
        let (store, _) =
            store_over(|_| Ok(ApiResponse::new(500, json!({"message": "boom"}))));
        let err = store.fetch(FetchOptions::default()).await.unwrap_err();
        assert_eq!(store.last_error(), Some(err));
    }

    #[tokio::test]
    async fn test_hydrate_restores_recent_snapshot() {
        let storage = Storage::in_memory();
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(page(vec![server_note(1, 0), server_note(2, 1)]))
        }));
        let first = store_with(transport.clone(), storage.clone());
        first.fetch(FetchOptions::default()).await.unwrap();

        let second = store_with(transport, storage);
        assert!(second.hydrate());
        assert_eq!(ids(&second), vec![server_id(1), server_id(2)]);
        assert_eq!(second.total(), 2);
    }

    #[tokio::test]
    async fn test_hydrate_without_snapshot() {
        let (store, _) = store_over(|_| Ok(page(vec![])));
        assert!(!store.hydrate());
    }

    #[tokio::test]
    async fn test_client_events_become_local_notices() {
        let (store, _) = store_over(|_| Ok(page(vec![])));
        let (tx, rx) = broadcast::channel(8);
        let watcher = store.watch_client_events(rx);

        tx.send(ClientEvent::RateLimited {
            message: "Too many requests.".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        })
        .unwrap();
        tx.send(ClientEvent::SignedIn).unwrap();
        drop(tx);
        watcher.await.unwrap();

        let list = store.notifications();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, NotificationKind::RateLimit);
        assert_eq!(list[0].message, "Too many requests. Try again in 30s.");
        assert!(!store.is_server_id(&list[0].id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_pushes_update_the_list() {
        let initial = json!({ "notifications": [server_note(1, 10)], "total": 4 });
        let pushed = server_note(2, 0);
        let body = format!(
            "event: connected\ndata: {{}}\n\nevent: initial\ndata: {initial}\n\nevent: notification\ndata: {pushed}\n\n"
        );
        let connector = Arc::new(ScriptedConnector::new(vec![chunks(&[body.as_str()])]));

        let (store, _) = store_over(|_| Ok(page(vec![])));
        let transport = StreamTransport::new(
            connector.clone(),
            store.inner.client.clone(),
            StreamOptions::default(),
        );

        let handle = store.subscribe(&transport);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(ids(&store), vec![server_id(2), server_id(1)]);
        assert_eq!(store.total(), 5);
        assert!(lock_url(&connector).ends_with("/notifications/stream"));
        handle.close();
        assert_eq!(handle.state(), StreamState::Closed);
    }

    fn lock_url(connector: &ScriptedConnector) -> String {
        connector.requests.lock().unwrap()[0].url.clone()
    }
}
