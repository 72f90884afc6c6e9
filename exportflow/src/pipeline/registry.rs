//! Registry of runs that have not reached a terminal status.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// Shared per-run state between the executing task and `cancel`.
#[derive(Debug)]
pub struct RunHandle {
    owner: String,
    cancelled: AtomicBool,
    wake: Notify,
    persist_lock: Mutex<()>,
}

impl RunHandle {
    /// Creates a handle for a run owned by `owner`.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
            persist_lock: Mutex::new(()),
        }
    }

    /// Returns the owner of the run.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Flags the run as cancelled and wakes a pending backoff sleep.
    ///
    /// Returns false if it was already flagged.
    pub fn request_cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.wake.notify_waiters();
        }
        first
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.wake.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Serializes snapshot writes for this run.
    pub async fn lock_persist(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.persist_lock.lock().await
    }
}

/// Thread-safe map of active runs.
#[derive(Debug, Default)]
pub struct ActiveRunRegistry {
    runs: DashMap<Uuid, Arc<RunHandle>>,
}

impl ActiveRunRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run and returns its handle.
    pub fn register(&self, id: Uuid, owner: &str) -> Arc<RunHandle> {
        let handle = Arc::new(RunHandle::new(owner));
        self.runs.insert(id, Arc::clone(&handle));
        handle
    }

    /// Removes a run. Returns the handle if it was still registered.
    pub fn unregister(&self, id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.remove(&id).map(|(_, handle)| handle)
    }

    /// Returns the handle of an active run.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns true if the run is registered.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.runs.contains_key(&id)
    }

    /// Returns the number of active runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if no runs are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_unregister() {
        let registry = ActiveRunRegistry::new();
        let id = Uuid::new_v4();

        let handle = registry.register(id, "u1");
        assert_eq!(handle.owner(), "u1");
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_request_cancel_once() {
        let handle = RunHandle::new("u1");
        assert!(!handle.is_cancelled());
        assert!(handle.request_cancel());
        assert!(!handle.request_cancel());
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wakes_waiter() {
        let handle = Arc::new(RunHandle::new("u1"));
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                tokio::select! {
                    () = handle.cancelled() => true,
                    () = tokio::time::sleep(Duration::from_secs(300)) => false,
                }
            })
        };

        tokio::task::yield_now().await;
        handle.request_cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_flagged() {
        let handle = RunHandle::new("u1");
        handle.request_cancel();
        handle.cancelled().await;
    }
}
