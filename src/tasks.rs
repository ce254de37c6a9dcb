//! Background task registry.
//!
//! Every fire-and-forget task — memory extraction, transcript persistence,
//! the active timer — is spawned through the registry so shutdown is
//! deterministic: `shutdown_all` cancels and awaits everything before the
//! process tears down shared resources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifier of a registered background task.
pub type TaskId = u64;

struct TaskEntry {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Tracks, auto-reaps, and cancels background tasks.
///
/// Completed tasks remove themselves; `shutdown_all` leaves the set empty.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<TaskId, TaskEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task.
    ///
    /// The future runs until completion or until its cancellation token
    /// fires; either way the entry self-removes. The future should check the
    /// token at its own suspension points for cooperative unwinding of any
    /// inner work.
    pub fn spawn<F>(&self, name: &str, make: impl FnOnce(CancellationToken) -> F) -> TaskId
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let fut = make(cancel.clone());

        {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.insert(
                id,
                TaskEntry {
                    name: name.to_owned(),
                    cancel: cancel.clone(),
                    handle: None,
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        let task_name = name.to_owned();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("background task '{task_name}' cancelled");
                }
                () = fut => {}
            }
            let mut map = inner.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&id);
        });

        // The task may have already finished and removed itself; only store
        // the handle if the entry is still present.
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(&id) {
            entry.handle = Some(handle);
        }
        id
    }

    /// Cancel one task by id. No-op if it already finished.
    pub fn cancel(&self, id: TaskId) {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get(&id) {
            entry.cancel.cancel();
        }
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task and await them all, suppressing errors.
    ///
    /// After this returns the set is empty and no registered task will run
    /// again, so pools and clients are safe to close.
    pub async fn shutdown_all(&self) {
        let entries: Vec<TaskEntry> = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return;
        }

        debug!("cancelling {} background tasks", entries.len());
        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            if let Some(handle) = entry.handle
                && let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!("background task '{}' panicked: {e}", entry.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn completed_task_self_removes() {
        let registry = TaskRegistry::new();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);

        registry.spawn("quick", move |_cancel| async move {
            done_clone.store(true, Ordering::SeqCst);
        });

        // Yield until the task has reaped itself.
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(done.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_and_empties() {
        let registry = TaskRegistry::new();
        for i in 0..4 {
            registry.spawn(&format!("sleeper-{i}"), |_cancel| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
        }
        assert_eq!(registry.len(), 4);

        let start = std::time::Instant::now();
        registry.shutdown_all().await;
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn task_stops_before_resources_close() {
        let registry = TaskRegistry::new();
        let resource_alive = Arc::new(AtomicBool::new(true));
        let observed_dead = Arc::new(AtomicBool::new(false));

        let alive = Arc::clone(&resource_alive);
        let observed = Arc::clone(&observed_dead);
        registry.spawn("poller", move |cancel| async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_millis(1)) => {
                        if !alive.load(Ordering::SeqCst) {
                            observed.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }
        });

        // Shutdown first, then tear the resource down — the task must never
        // see it dead.
        registry.shutdown_all().await;
        resource_alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!observed_dead.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancel_single_task() {
        let registry = TaskRegistry::new();
        let id = registry.spawn("one", |_cancel| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.spawn("two", |_cancel| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        registry.cancel(id);
        for _ in 0..100 {
            if registry.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.len(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn shutdown_on_empty_registry_is_noop() {
        let registry = TaskRegistry::new();
        registry.shutdown_all().await;
        assert!(registry.is_empty());
    }
}
