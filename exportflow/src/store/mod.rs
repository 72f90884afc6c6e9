//! Persistence for run snapshots.
//!
//! Snapshots are stored as serialized JSON keyed by run id. There is no
//! secondary index: owner queries and the expiry sweep scan every record,
//! which is acceptable for small payloads and capped history queries.

mod kv;
mod memory;

pub use kv::{connect_state_store, InMemoryKeyValue, KeyValueBackend, TtlStateStore, KEY_PREFIX};
pub use memory::InMemoryStateStore;

use crate::context::PipelineContext;
use crate::errors::StoreError;
use async_trait::async_trait;
use uuid::Uuid;

/// Protocol for run-state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Saves (inserts or overwrites) a snapshot.
    async fn save(&self, ctx: &PipelineContext) -> Result<(), StoreError>;

    /// Gets a snapshot by run id.
    async fn get(&self, id: Uuid) -> Result<Option<PipelineContext>, StoreError>;

    /// Returns every stored snapshot, in no particular order.
    async fn list_all(&self) -> Result<Vec<PipelineContext>, StoreError>;

    /// Deletes a snapshot. Returns true if one existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Returns a short name identifying the backend.
    fn backend_name(&self) -> &'static str;

    /// Returns up to `limit` snapshots owned by `owner`, newest first.
    async fn scan_by_owner(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<PipelineContext>, StoreError> {
        let mut owned: Vec<PipelineContext> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|ctx| ctx.owner == owner)
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit);
        Ok(owned)
    }
}

pub(crate) fn encode(ctx: &PipelineContext) -> Result<String, StoreError> {
    Ok(serde_json::to_string(ctx)?)
}

pub(crate) fn decode(raw: &str) -> Result<PipelineContext, StoreError> {
    Ok(serde_json::from_str(raw)?)
}
