//! Key-value storage adapter.
//!
//! Holds the bearer token, the remember-preference flag and small cache blobs.
//! Every value is stored as JSON. A record that no longer deserializes is
//! treated as absent and removed, so a corrupt file never blocks start-up.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::StorageError;

pub mod capability;

pub use capability::{CapabilityCache, EndpointCapability};

pub const TOKEN_KEY: &str = "token";
pub const TOKEN_EXPIRY_KEY: &str = "tokenExpiry";
pub const REMEMBER_ME_KEY: &str = "rememberMe";

/// Raw string storage. `Storage` layers JSON and corruption handling on top.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Session-scoped storage: lives as long as the process.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Durable storage: one JSON file per key under a directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        // Write-then-rename so a crash never leaves a half-written record.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Survives restarts.
    Durable,
    /// Dropped when the process exits.
    Session,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedBlob<T> {
    value: T,
    stored_at: DateTime<Utc>,
}

/// JSON key-value store over a durable and a session-scoped backend.
#[derive(Clone)]
pub struct Storage {
    durable: Arc<dyn StorageBackend>,
    session: Arc<dyn StorageBackend>,
}

impl Storage {
    pub fn new(durable: Arc<dyn StorageBackend>, session: Arc<dyn StorageBackend>) -> Self {
        Self { durable, session }
    }

    /// File-backed durable scope under `dir`, in-memory session scope.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self::new(
            Arc::new(FileBackend::open(dir)?),
            Arc::new(MemoryBackend::new()),
        ))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(MemoryBackend::new()))
    }

    fn backend(&self, scope: Scope) -> &dyn StorageBackend {
        match scope {
            Scope::Durable => self.durable.as_ref(),
            Scope::Session => self.session.as_ref(),
        }
    }

    /// Reads and deserializes `key`. Missing, unreadable and corrupt records all
    /// come back as `None`; corrupt ones are removed.
    pub fn get<T: DeserializeOwned>(&self, scope: Scope, key: &str) -> Option<T> {
        let raw = match self.backend(scope).get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Storage read of '{key}' failed: {e}");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding corrupt storage record '{key}': {e}");
                self.remove(scope, key);
                None
            }
        }
    }

    pub fn set<T: Serialize + ?Sized>(
        &self,
        scope: Scope,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.backend(scope).set(key, &raw)
    }

    pub fn remove(&self, scope: Scope, key: &str) {
        if let Err(e) = self.backend(scope).remove(key) {
            warn!("Storage remove of '{key}' failed: {e}");
        }
    }

    // ── Credentials ────────────────────────────────────────────────────────

    /// Session-scoped token wins over a remembered one.
    pub fn token(&self) -> Option<String> {
        self.get(Scope::Session, TOKEN_KEY)
            .or_else(|| self.get(Scope::Durable, TOKEN_KEY))
    }

    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.get(Scope::Session, TOKEN_EXPIRY_KEY)
            .or_else(|| self.get(Scope::Durable, TOKEN_EXPIRY_KEY))
    }

    pub fn remember_me(&self) -> bool {
        self.get(Scope::Durable, REMEMBER_ME_KEY).unwrap_or(false)
    }

    /// Sign-in path: records the remember preference, then the token.
    pub fn store_credentials(
        &self,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
        remember: bool,
    ) -> Result<(), StorageError> {
        self.set(Scope::Durable, REMEMBER_ME_KEY, &remember)?;
        self.store_token(token, expires_at)
    }

    /// Refresh path: places the token in durable or session scope according
    /// to the stored remember preference, and clears the other scope.
    pub fn store_token(
        &self,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let (target, other) = if self.remember_me() {
            (Scope::Durable, Scope::Session)
        } else {
            (Scope::Session, Scope::Durable)
        };

        self.set(target, TOKEN_KEY, token)?;
        match expires_at {
            Some(at) => self.set(target, TOKEN_EXPIRY_KEY, &at)?,
            None => self.remove(target, TOKEN_EXPIRY_KEY),
        }
        self.remove(other, TOKEN_KEY);
        self.remove(other, TOKEN_EXPIRY_KEY);

        debug!("Stored access token ({target:?})");
        Ok(())
    }

    pub fn clear_credentials(&self) {
        for scope in [Scope::Durable, Scope::Session] {
            self.remove(scope, TOKEN_KEY);
            self.remove(scope, TOKEN_EXPIRY_KEY);
        }
        self.remove(Scope::Durable, REMEMBER_ME_KEY);
    }

    // ── Short-TTL cache blobs ──────────────────────────────────────────────

    pub fn set_blob<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let blob = CachedBlob {
            value,
            stored_at: Utc::now(),
        };
        self.set(Scope::Durable, key, &blob)
    }

    /// Returns the blob only while it is younger than `ttl`.
    pub fn fresh_blob<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let blob: CachedBlob<T> = self.get(Scope::Durable, key)?;
        let age = Utc::now()
            .signed_duration_since(blob.stored_at)
            .to_std()
            .unwrap_or_default();
        if age < ttl {
            Some(blob.value)
        } else {
            self.remove(Scope::Durable, key);
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
