//! Named reentrant counted locks with status observability
//!
//! The registry holds a fixed set of advisory locks. Each lock is a
//! `{count, operations}` pair rather than a mutex: multiple concurrent
//! holders are visible as a single locked state with a list of operation
//! descriptions. `wait_for_unlock` lets readers drain writers without ever
//! blocking them.
//!
//! Lock ordering is fixed: a holder that needs both primary locks must
//! acquire `ingestion` before `embedding`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Lock serializing graph writes from ingestion
pub const INGESTION_LOCK: &str = "ingestion";
/// Lock serializing vector write-back from embedding
pub const EMBEDDING_LOCK: &str = "embedding";

/// One active acquisition, as reported by `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct LockOperation {
    /// Human-readable description supplied at acquire time
    pub description: String,
    /// When this acquisition happened
    pub acquired_at: DateTime<Utc>,
}

/// Snapshot of a named lock
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    /// True while at least one handle is outstanding
    pub is_locked: bool,
    /// Number of outstanding handles
    pub operation_count: usize,
    /// Descriptions of the outstanding acquisitions
    pub operations: Vec<LockOperation>,
}

/// Callback fired when a lock transitions between locked and unlocked
pub type LockObserver = Arc<dyn Fn(&str, bool) + Send + Sync>;

type ObserverSlot = Arc<Mutex<Option<LockObserver>>>;

#[derive(Default)]
struct LockState {
    ops: BTreeMap<u64, LockOperation>,
}

struct NamedLock {
    name: String,
    state: Mutex<LockState>,
    drained: Notify,
    observer: ObserverSlot,
}

impl NamedLock {
    fn release(&self, id: u64) {
        let now_unlocked = {
            let mut state = self.state.lock();
            if state.ops.remove(&id).is_none() {
                warn!(lock = %self.name, handle = id, "Double release ignored");
                return;
            }
            state.ops.is_empty()
        };

        if now_unlocked {
            self.drained.notify_waiters();
            self.notify_observer(false);
        }
        debug!(lock = %self.name, handle = id, "Lock released");
    }

    fn notify_observer(&self, is_locked: bool) {
        let observer = self.observer.lock().clone();
        if let Some(cb) = observer {
            cb(&self.name, is_locked);
        }
    }
}

/// Registry of named reentrant counted locks
///
/// Locks are advisory within the process. Acquisition never blocks; the
/// count simply grows. Readers that want a consistent view call
/// `wait_for_unlock` with a budget and tolerate timeouts.
pub struct LockRegistry {
    locks: HashMap<String, Arc<NamedLock>>,
    observer: ObserverSlot,
    next_handle: AtomicU64,
}

impl LockRegistry {
    /// Create a registry holding the two primary daemon locks
    #[must_use]
    pub fn new() -> Self {
        Self::with_names(&[INGESTION_LOCK, EMBEDDING_LOCK])
    }

    /// Create a registry with an explicit set of lock names
    #[must_use]
    pub fn with_names(names: &[&str]) -> Self {
        let observer: ObserverSlot = Arc::new(Mutex::new(None));
        let locks = names
            .iter()
            .map(|n| {
                (
                    (*n).to_string(),
                    Arc::new(NamedLock {
                        name: (*n).to_string(),
                        state: Mutex::new(LockState::default()),
                        drained: Notify::new(),
                        observer: Arc::clone(&observer),
                    }),
                )
            })
            .collect();

        Self {
            locks,
            observer,
            next_handle: AtomicU64::new(1),
        }
    }

    /// Install the status-change observer, replacing any previous one
    ///
    /// The observer fires with `(name, is_locked)` on every 0↔1 transition
    /// of a lock's operation count.
    pub fn set_observer(&self, observer: LockObserver) {
        *self.observer.lock() = Some(observer);
    }

    /// Acquire the named lock, incrementing its operation count
    ///
    /// Returns a handle that releases on drop. Acquiring an unknown name
    /// is a programming error; it panics in debug builds and returns an
    /// inert handle in release builds.
    #[must_use]
    pub fn acquire(&self, name: &str, description: impl Into<String>) -> LockHandle {
        let Some(lock) = self.locks.get(name) else {
            debug_assert!(false, "unknown lock name: {name}");
            warn!("Acquire on unknown lock {name}; returning inert handle");
            return LockHandle { lock: None, id: 0 };
        };

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let was_unlocked = {
            let mut state = lock.state.lock();
            let was_empty = state.ops.is_empty();
            state.ops.insert(
                id,
                LockOperation {
                    description: description.into(),
                    acquired_at: Utc::now(),
                },
            );
            was_empty
        };

        if was_unlocked {
            lock.notify_observer(true);
        }
        debug!(lock = name, handle = id, "Lock acquired");

        LockHandle {
            lock: Some(Arc::clone(lock)),
            id,
        }
    }

    /// Whether the named lock currently has any holders
    #[must_use]
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .is_some_and(|l| !l.state.lock().ops.is_empty())
    }

    /// Snapshot the named lock's holders
    #[must_use]
    pub fn get_status(&self, name: &str) -> LockStatus {
        self.locks.get(name).map_or(
            LockStatus {
                is_locked: false,
                operation_count: 0,
                operations: Vec::new(),
            },
            |l| {
                let state = l.state.lock();
                LockStatus {
                    is_locked: !state.ops.is_empty(),
                    operation_count: state.ops.len(),
                    operations: state.ops.values().cloned().collect(),
                }
            },
        )
    }

    /// Block until the named lock's count reaches zero or the timeout
    /// elapses. Returns `true` if the lock drained.
    pub async fn wait_for_unlock(&self, name: &str, timeout: Duration) -> bool {
        let Some(lock) = self.locks.get(name) else {
            return true;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking the count so a release
            // between the check and the await cannot be missed.
            let drained = lock.drained.notified();
            if lock.state.lock().ops.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return lock.state.lock().ops.is_empty();
            }
        }
    }

    /// Run `fut` while holding the named lock, releasing on every exit path
    pub async fn with_lock<T, F>(&self, name: &str, description: impl Into<String>, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _handle = self.acquire(name, description);
        fut.await
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for one lock acquisition; releases exactly once, on drop
pub struct LockHandle {
    lock: Option<Arc<NamedLock>>,
    id: u64,
}

impl LockHandle {
    /// Release the handle explicitly (equivalent to dropping it)
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_counted_acquire_release() {
        let registry = Arc::new(LockRegistry::new());

        let h1 = registry.acquire(INGESTION_LOCK, "ingest a");
        let h2 = registry.acquire(INGESTION_LOCK, "ingest b");

        let status = registry.get_status(INGESTION_LOCK);
        assert!(status.is_locked);
        assert_eq!(status.operation_count, 2);
        assert_eq!(status.operations.len(), 2);

        h1.release();
        assert!(registry.is_locked(INGESTION_LOCK));

        h2.release();
        assert!(!registry.is_locked(INGESTION_LOCK));
        assert_eq!(registry.get_status(INGESTION_LOCK).operation_count, 0);
    }

    #[tokio::test]
    async fn test_wait_for_unlock_times_out_while_held() {
        let registry = Arc::new(LockRegistry::new());
        let _h = registry.acquire(EMBEDDING_LOCK, "embedding run");

        let drained = registry
            .wait_for_unlock(EMBEDDING_LOCK, Duration::from_millis(50))
            .await;
        assert!(!drained);
    }

    #[tokio::test]
    async fn test_wait_for_unlock_wakes_on_release() {
        let registry = Arc::new(LockRegistry::new());
        let handle = registry.acquire(INGESTION_LOCK, "slow ingest");

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .wait_for_unlock(INGESTION_LOCK, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.release();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_on_free_lock_returns_immediately() {
        let registry = Arc::new(LockRegistry::new());
        assert!(
            registry
                .wait_for_unlock(INGESTION_LOCK, Duration::from_millis(1))
                .await
        );
    }

    #[tokio::test]
    async fn test_observer_fires_on_transitions_only() {
        let registry = Arc::new(LockRegistry::new());
        let transitions = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&transitions);
        registry.set_observer(Arc::new(move |_name, _locked| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let h1 = registry.acquire(INGESTION_LOCK, "a"); // 0 -> 1: fires
        let h2 = registry.acquire(INGESTION_LOCK, "b"); // 1 -> 2: silent
        h2.release(); // 2 -> 1: silent
        h1.release(); // 1 -> 0: fires

        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_exit() {
        let registry = Arc::new(LockRegistry::new());

        let out = registry
            .with_lock(INGESTION_LOCK, "scoped", async { 7 })
            .await;
        assert_eq!(out, 7);
        assert!(!registry.is_locked(INGESTION_LOCK));
    }

    #[tokio::test]
    async fn test_handle_drop_releases() {
        let registry = Arc::new(LockRegistry::new());
        {
            let _handle = registry.acquire(EMBEDDING_LOCK, "scoped by drop");
            assert!(registry.is_locked(EMBEDDING_LOCK));
        }
        assert!(!registry.is_locked(EMBEDDING_LOCK));
    }
}
