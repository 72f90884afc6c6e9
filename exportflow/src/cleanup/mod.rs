//! Resource hygiene: temp-file removal, the expiry sweep, and cleanup
//! detached from a cancelled run.

use crate::store::StateStore;
use crate::errors::StoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A failure reported by a detached cleanup task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// The run being cleaned up.
    pub run_id: Uuid,
    /// The file involved, if any.
    pub path: Option<PathBuf>,
    /// What went wrong.
    pub message: String,
}

async fn remove_file(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Deletes every path in `paths`, concurrently.
///
/// Missing files count as removed. Returns one warning per file that could
/// not be deleted; failures never propagate.
pub async fn cleanup_temp_files(paths: &[PathBuf]) -> Vec<String> {
    let results = join_all(paths.iter().map(|path| async move {
        remove_file(path).await.map_err(|e| (path, e))
    }))
    .await;

    let mut warnings = Vec::new();
    for result in results {
        if let Err((path, e)) = result {
            warn!(path = %path.display(), error = %e, "Failed to remove temp file");
            warnings.push(format!("Failed to remove temp file {}: {e}", path.display()));
        }
    }
    debug!(count = paths.len(), failed = warnings.len(), "Temp file cleanup finished");
    warnings
}

/// Removes every record created strictly before `now - max_age`.
///
/// A record exactly `max_age` old is kept. Terminal status is not
/// considered. Returns the ids that were deleted.
pub async fn purge_older_than(
    store: &dyn StateStore,
    max_age: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, StoreError> {
    let cutoff = now - max_age;
    let mut purged = Vec::new();
    for record in store.list_all().await? {
        if record.created_at < cutoff && store.delete(record.id).await? {
            purged.push(record.id);
        }
    }
    info!(
        purged = purged.len(),
        cutoff = %cutoff.to_rfc3339(),
        backend = store.backend_name(),
        "Expired run records purged"
    );
    Ok(purged)
}

/// Removes a run's artifact directory and everything left in it.
///
/// Only used for runs that did not complete. A missing directory counts as
/// removed. Returns a warning if the directory could not be deleted.
pub async fn discard_run_dir(dir: &Path) -> Option<String> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => None,
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Failed to remove run directory");
            Some(format!("Failed to remove run directory {}: {e}", dir.display()))
        }
    }
}

/// Runs file cleanup for a run on its own task.
///
/// The caller does not wait for it. Every failure, including a timeout, is
/// logged and reported on `failures`.
pub fn spawn_detached_cleanup(
    run_id: Uuid,
    paths: Vec<PathBuf>,
    timeout: Duration,
    failures: mpsc::Sender<CleanupFailure>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let work = join_all(paths.iter().map(|path| async move {
            remove_file(path).await.map_err(|e| (path.clone(), e))
        }));

        match tokio::time::timeout(timeout, work).await {
            Ok(results) => {
                for (path, e) in results.into_iter().filter_map(Result::err) {
                    warn!(run_id = %run_id, path = %path.display(), error = %e, "Detached cleanup failed");
                    report(&failures, CleanupFailure {
                        run_id,
                        path: Some(path),
                        message: e.to_string(),
                    });
                }
            }
            Err(_) => {
                warn!(run_id = %run_id, timeout_secs = timeout.as_secs_f64(), "Detached cleanup timed out");
                report(&failures, CleanupFailure {
                    run_id,
                    path: None,
                    message: format!("Cleanup timed out after {}s", timeout.as_secs_f64()),
                });
            }
        }
    })
}

fn report(failures: &mpsc::Sender<CleanupFailure>, failure: CleanupFailure) {
    match failures.try_send(failure) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(run_id = %dropped.run_id, "Cleanup failure channel full, report dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Cleanup failure channel closed");
        }
    }
}

/// Reports kept for callers before new ones are dropped.
pub const DEFAULT_FAILURE_CAPACITY: usize = 256;

/// Shared sender plus the receiver callers drain.
///
/// Bounded: once `capacity` reports are waiting, further failures are only
/// logged. Callers that care should drain it periodically.
#[derive(Debug)]
pub struct CleanupFailureChannel {
    sender: mpsc::Sender<CleanupFailure>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<CleanupFailure>>,
}

impl Default for CleanupFailureChannel {
    fn default() -> Self {
        Self::bounded(DEFAULT_FAILURE_CAPACITY)
    }
}

impl CleanupFailureChannel {
    /// Creates a channel with the default capacity.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a channel holding at most `capacity` undrained reports.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self::bounded(capacity))
    }

    fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Returns a sender for a detached task.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<CleanupFailure> {
        self.sender.clone()
    }

    /// Returns every failure reported so far without waiting.
    pub async fn drain(&self) -> Vec<CleanupFailure> {
        let mut receiver = self.receiver.lock().await;
        let mut failures = Vec::new();
        while let Ok(failure) = receiver.try_recv() {
            failures.push(failure);
        }
        failures
    }

    /// Waits for the next failure.
    pub async fn recv(&self) -> Option<CleanupFailure> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContext;
    use crate::store::InMemoryStateStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_removes_files_and_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        tokio::fs::write(&a, b"{}").await.unwrap();

        let warnings = cleanup_temp_files(&[a.clone(), b]).await;
        assert!(warnings.is_empty());
        assert!(!a.exists());
    }

    #[tokio::test]
    async fn test_cleanup_reports_failures_as_warnings() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("not_a_file");
        tokio::fs::create_dir(&nested).await.unwrap();

        let warnings = cleanup_temp_files(&[nested.clone()]).await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("not_a_file"));
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_purge_boundary_is_exclusive() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();
        let make = |hours: i64, minutes: i64| {
            PipelineContext::new("u1", "f1", "typeform", 3)
                .with_created_at(now - ChronoDuration::hours(hours) - ChronoDuration::minutes(minutes))
        };
        let fresh = make(23, 0);
        let exact = make(24, 0);
        let old = make(25, 0);
        for ctx in [&fresh, &exact, &old] {
            store.save(ctx).await.unwrap();
        }

        let purged = purge_older_than(&store, ChronoDuration::hours(24), now).await.unwrap();
        assert_eq!(purged, vec![old.id]);
        assert!(store.get(fresh.id).await.unwrap().is_some());
        assert!(store.get(exact.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_detached_cleanup_reports_failures() {
        let dir = TempDir::new().unwrap();
        let ok = dir.path().join("ok.json");
        tokio::fs::write(&ok, b"{}").await.unwrap();
        let stuck = dir.path().join("stuck");
        tokio::fs::create_dir(&stuck).await.unwrap();

        let channel = CleanupFailureChannel::new();
        let run_id = Uuid::new_v4();
        spawn_detached_cleanup(
            run_id,
            vec![ok.clone(), stuck.clone()],
            Duration::from_secs(5),
            channel.sender(),
        )
        .await
        .unwrap();

        assert!(!ok.exists());
        let failures = channel.drain().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].run_id, run_id);
        assert_eq!(failures[0].path.as_deref(), Some(stuck.as_path()));
    }

    #[tokio::test]
    async fn test_full_failure_channel_drops_extra_reports() {
        let dir = TempDir::new().unwrap();
        let stuck: Vec<PathBuf> = (0..3)
            .map(|i| dir.path().join(format!("stuck_{i}")))
            .collect();
        for path in &stuck {
            tokio::fs::create_dir(path).await.unwrap();
        }

        let channel = CleanupFailureChannel::with_capacity(2);
        spawn_detached_cleanup(Uuid::new_v4(), stuck, Duration::from_secs(5), channel.sender())
            .await
            .unwrap();

        assert_eq!(channel.drain().await.len(), 2);
        assert!(channel.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_discard_run_dir_removes_leftovers() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("run");
        tokio::fs::create_dir(&run_dir).await.unwrap();
        tokio::fs::write(run_dir.join("export.csv"), b"a,b").await.unwrap();

        assert_eq!(discard_run_dir(&run_dir).await, None);
        assert!(!run_dir.exists());
        assert_eq!(discard_run_dir(&run_dir).await, None);
    }
}
