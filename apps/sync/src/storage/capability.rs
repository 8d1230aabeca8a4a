use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Scope, Storage};

/// Persisted record of whether an optional endpoint exists on this deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCapability {
    pub available: bool,
    pub checked_at: DateTime<Utc>,
}

/// Expirable capability cache. Suppresses repeated requests to endpoints the
/// server has already reported missing, until the record ages out.
#[derive(Clone)]
pub struct CapabilityCache {
    storage: Storage,
    ttl: Duration,
}

impl CapabilityCache {
    pub fn new(storage: Storage, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    fn key(endpoint: &str) -> String {
        format!("capability:{endpoint}")
    }

    /// The stored record, unless it is older than the TTL.
    pub fn get(&self, endpoint: &str) -> Option<EndpointCapability> {
        let key = Self::key(endpoint);
        let record: EndpointCapability = self.storage.get(Scope::Durable, &key)?;
        let age = Utc::now()
            .signed_duration_since(record.checked_at)
            .to_std()
            .unwrap_or_default();
        if age >= self.ttl {
            self.storage.remove(Scope::Durable, &key);
            return None;
        }
        Some(record)
    }

    pub fn is_unavailable(&self, endpoint: &str) -> bool {
        matches!(self.get(endpoint), Some(EndpointCapability { available: false, .. }))
    }

    pub fn mark(&self, endpoint: &str, available: bool) {
        let previous = self.get(endpoint).map(|c| c.available);
        let record = EndpointCapability {
            available,
            checked_at: Utc::now(),
        };
        if let Err(e) = self.storage.set(Scope::Durable, &Self::key(endpoint), &record) {
            tracing::warn!("Failed to persist capability for '{endpoint}': {e}");
            return;
        }
        if previous != Some(available) {
            info!("Endpoint '{endpoint}' marked available={available}");
        }
    }

    pub fn forget(&self, endpoint: &str) {
        self.storage.remove(Scope::Durable, &Self::key(endpoint));
    }
}
