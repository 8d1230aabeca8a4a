use std::time::Duration;

use anyhow::{Context, Result};

use crate::client::ClientOptions;
use crate::stream::StreamOptions;

/// Sync client configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub storage_dir: String,
    /// Signs in with this token on startup when set.
    pub token: Option<String>,
    pub remember: bool,
    pub request_timeout: Duration,
    pub cache_ttl: Duration,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            api_url: require_env("TEMPLAR_API_URL")?,
            storage_dir: std::env::var("TEMPLAR_STORAGE_DIR")
                .unwrap_or_else(|_| ".templar".to_string()),
            token: std::env::var("TEMPLAR_TOKEN").ok().filter(|t| !t.is_empty()),
            remember: std::env::var("TEMPLAR_REMEMBER")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            request_timeout: secs_env("REQUEST_TIMEOUT_SECS", 30)?,
            cache_ttl: secs_env("CACHE_TTL_SECS", 30)?,
            poll_interval: secs_env("POLL_INTERVAL_SECS", 180)?,
            reconnect_delay: secs_env("RECONNECT_DELAY_SECS", 5)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.api_url.clone(),
            timeout: self.request_timeout,
            cache_ttl: self.cache_ttl,
            ..ClientOptions::default()
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            poll_interval: self.poll_interval,
            reconnect_delay: self.reconnect_delay,
            ..StreamOptions::default()
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn secs_env(key: &str, default: u64) -> Result<Duration> {
    let secs = match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{key} must be a whole number of seconds"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}
