//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use exportflow::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// An engine writing artifacts under `dir`, retrying immediately.
pub fn engine(dir: &TempDir, stages: StageSet) -> (Arc<PipelineEngine>, Arc<InMemoryStateStore>) {
    let store = Arc::new(InMemoryStateStore::new());
    let config = EngineConfig::default().with_work_dir(dir.path());
    let engine = PipelineEngine::new(store.clone(), stages, config)
        .with_retry_policy(RetryPolicy::immediate(3));
    (Arc::new(engine), store)
}

/// The standard stages bound to `collaborators` with the default threshold.
pub fn standard(collaborators: &Collaborators) -> StageSet {
    StageSet::standard(collaborators, EngineConfig::default().compression_threshold_bytes)
}

/// Polls the store until the run reaches `status`.
pub async fn wait_for_status(engine: &PipelineEngine, id: uuid::Uuid, status: PipelineStatus) {
    for _ in 0..500 {
        if let Some(ctx) = engine.get_status(id).await.unwrap() {
            if ctx.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {id} never reached {status}");
}
