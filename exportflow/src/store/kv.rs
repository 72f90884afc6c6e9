//! State store on top of an external TTL-capable key-value service.

use super::{decode, encode, InMemoryStateStore, StateStore};
use crate::context::PipelineContext;
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Prefix of every run-state key.
pub const KEY_PREFIX: &str = "pipeline:";

/// The subset of a key-value service the state store needs.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Checks connectivity.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Stores `value` under `key`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Gets the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Lists keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Deletes `key`. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// State store backed by a [`KeyValueBackend`].
///
/// Every save refreshes the record's TTL, so a record lives for the TTL
/// window after the last state change.
pub struct TtlStateStore {
    backend: Arc<dyn KeyValueBackend>,
    ttl: Duration,
}

impl std::fmt::Debug for TtlStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlStateStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TtlStateStore {
    /// Wraps `backend` with the given record TTL.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn key(id: Uuid) -> String {
        format!("{KEY_PREFIX}{id}")
    }
}

#[async_trait]
impl StateStore for TtlStateStore {
    async fn save(&self, ctx: &PipelineContext) -> Result<(), StoreError> {
        let raw = encode(ctx)?;
        self.backend.set_with_ttl(&Self::key(ctx.id), raw, self.ttl).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<PipelineContext>, StoreError> {
        let raw = self.backend.get(&Self::key(id)).await?;
        raw.as_deref().map(decode).transpose()
    }

    async fn list_all(&self) -> Result<Vec<PipelineContext>, StoreError> {
        let keys = self.backend.keys_with_prefix(KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // A key can expire between the scan and the read.
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            match decode(&raw) {
                Ok(ctx) => records.push(ctx),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable state record"),
            }
        }
        Ok(records)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.backend.delete(&Self::key(id)).await
    }

    fn backend_name(&self) -> &'static str {
        "external"
    }
}

/// Picks the external store if it answers, otherwise the in-memory store.
pub async fn connect_state_store(
    backend: Option<Arc<dyn KeyValueBackend>>,
    ttl: Duration,
) -> Arc<dyn StateStore> {
    if let Some(backend) = backend {
        match backend.ping().await {
            Ok(()) => {
                info!(ttl_seconds = ttl.as_secs(), "Using external state store");
                return Arc::new(TtlStateStore::new(backend, ttl));
            }
            Err(e) => {
                warn!(error = %e, "External state store unavailable, falling back to memory");
            }
        }
    }
    Arc::new(InMemoryStateStore::new())
}

#[derive(Debug, Clone)]
struct ExpiringValue {
    value: String,
    expires_at: Instant,
}

/// In-process key-value service with per-key expiry.
///
/// Stands in for an external service in tests and single-node deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyValue {
    entries: Arc<Mutex<HashMap<String, ExpiringValue>>>,
    offline: Arc<Mutex<bool>>,
}

impl InMemoryKeyValue {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the service going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Returns true if there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if *self.offline.lock() {
            Err(StoreError::Unavailable("key-value service offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryKeyValue {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.check_online()?;
        self.entries.lock().insert(
            key.to_string(),
            ExpiringValue {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at <= Instant::now() {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires_at > now);
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        Ok(self.entries.lock().remove(key).is_some())
    }
}
