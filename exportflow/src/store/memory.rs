//! In-process state store used when no external store is reachable.

use super::{decode, encode, StateStore};
use crate::context::PipelineContext;
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// In-memory state store.
///
/// Records never expire on their own; the expiry sweep removes them.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStateStore {
    records: Arc<RwLock<HashMap<Uuid, String>>>,
}

impl InMemoryStateStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, ctx: &PipelineContext) -> Result<(), StoreError> {
        let raw = encode(ctx)?;
        self.records.write().insert(ctx.id, raw);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PipelineContext>, StoreError> {
        let raw = self.records.read().get(&id).cloned();
        raw.as_deref().map(decode).transpose()
    }

    async fn list_all(&self) -> Result<Vec<PipelineContext>, StoreError> {
        let raws: Vec<String> = self.records.read().values().cloned().collect();
        raws.iter().map(|raw| decode(raw)).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&id).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
