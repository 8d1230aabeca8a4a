use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use templar_sync::client::{with_retry, ReqwestTransport, RequestClient, RetryOptions};
use templar_sync::config::Config;
use templar_sync::notifications::{FetchOptions, NotificationStore, StoreOptions};
use templar_sync::storage::Storage;
use templar_sync::stream::StreamTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Templar sync v{}", env!("CARGO_PKG_VERSION"));

    let storage = Storage::open(&config.storage_dir)
        .with_context(|| format!("Failed to open storage at '{}'", config.storage_dir))?;
    let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
    let client = RequestClient::new(transport.clone(), storage, config.client_options());
    info!("Request client initialized (base: {})", config.api_url);

    if let Some(token) = &config.token {
        client
            .sign_in(token, None, config.remember)
            .context("Failed to store credentials")?;
    }
    if client.bearer_token().is_none() {
        warn!("No stored session; requests will be anonymous");
    }

    let store = NotificationStore::new(client.clone(), StoreOptions::default());
    let events = store.watch_client_events(client.subscribe());

    if store.hydrate() {
        info!("Restored {} cached notifications", store.notifications().len());
    }
    let retry = RetryOptions::default();
    if let Err(e) = with_retry(&retry, || store.fetch(FetchOptions::default())).await {
        warn!("Initial notification fetch failed: {e}");
    }
    info!(
        "{} notifications ({} unread, {} total)",
        store.notifications().len(),
        store.unread_count(),
        store.total()
    );

    let streams = StreamTransport::new(transport, client.clone(), config.stream_options());
    let subscription = store.subscribe(&streams);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    subscription.close();
    events.abort();
    client.dispose();
    info!(
        "Final state: {} notifications, {} unread",
        store.notifications().len(),
        store.unread_count()
    );

    Ok(())
}
