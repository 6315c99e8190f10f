//! Debounced filesystem watcher feeding the ingestor
//!
//! One watcher per project. OS events land in a buffer keyed by path with
//! their change types coalesced; the buffer flushes once it has been
//! quiet for the debounce window, or unconditionally after the tail cap
//! so a busy editor cannot starve ingestion forever. Each flush is a
//! single parse + ingest call.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::ingestor::{IncrementalIngestor, IngestReport};
use crate::parser::{GlobFilter, ParseRequest, SourceParser};
use codebrain_core::{ChangeType, Project};

/// Debounce timing
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a flush
    pub debounce: Duration,
    /// Maximum age of the oldest buffered event before a forced flush
    pub max_tail: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            max_tail: Duration::from_secs(5),
        }
    }
}

/// Hook invoked after every non-empty ingestion
///
/// Panics and errors inside the hook are logged and swallowed; a broken
/// hook must not stall the pipeline.
pub type AfterIngestionHook = Arc<dyn Fn(&IngestReport) + Send + Sync>;

/// Introspection snapshot for `/watchers`
#[derive(Debug, Clone, serde::Serialize)]
pub struct WatcherStatus {
    pub project_id: uuid::Uuid,
    pub root: PathBuf,
    pub running: bool,
    pub pending_edits: usize,
    pub flushes: u64,
}

#[derive(Debug, Clone)]
struct PendingChange {
    change: ChangeType,
    first_seen: Instant,
    last_seen: Instant,
}

struct Shared {
    buffer: Mutex<HashMap<PathBuf, PendingChange>>,
    flushes: std::sync::atomic::AtomicU64,
}

/// Debounced watcher for one project
pub struct FileWatcher {
    project: Project,
    parser: Arc<dyn SourceParser>,
    ingestor: Arc<IncrementalIngestor>,
    config: WatcherConfig,
    hook: Option<AfterIngestionHook>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    os_watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileWatcher {
    /// Create a watcher; it does nothing until `start` is called
    #[must_use]
    pub fn new(
        project: Project,
        parser: Arc<dyn SourceParser>,
        ingestor: Arc<IncrementalIngestor>,
        config: WatcherConfig,
        hook: Option<AfterIngestionHook>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            project,
            parser,
            ingestor,
            config,
            hook,
            shared: Arc::new(Shared {
                buffer: Mutex::new(HashMap::new()),
                flushes: std::sync::atomic::AtomicU64::new(0),
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            task: Mutex::new(None),
            os_watcher: Mutex::new(None),
        }
    }

    /// Start watching
    ///
    /// Performs a full rescan first so edits made while the daemon was
    /// down are ingested, then subscribes to OS events. A second
    /// concurrent `start` collapses into the first.
    ///
    /// # Errors
    ///
    /// Fails if the OS watcher cannot be registered on the project root.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(project = %self.project.display_name, "Watcher already running");
            return Ok(());
        }

        info!(root = %self.project.path.display(), "Starting watcher with full rescan");
        if let Err(e) = self.run_ingestion(None, Vec::new()).await {
            // The rescan failing must not kill the watcher; the next
            // change will retry through the normal path.
            error!(error = %e, "Startup rescan failed");
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let filter = Arc::new(GlobFilter::new(
            &self.project.include_globs,
            &self.project.exclude_globs,
        )?);
        let root = self.project.path.clone();

        let mut os_watcher = {
            let filter = Arc::clone(&filter);
            let root = root.clone();
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                match result {
                    Ok(event) => {
                        let Some(change) = classify(&event.kind) else {
                            return;
                        };
                        for path in event.paths {
                            let relative = path.strip_prefix(&root).unwrap_or(&path);
                            if filter.matches(relative) {
                                let _ = event_tx.send((path.clone(), change));
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Watch event error"),
                }
            })?
        };
        os_watcher.watch(&self.project.path, RecursiveMode::Recursive)?;
        *self.os_watcher.lock() = Some(os_watcher);

        let watcher = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            watcher.run_loop(event_rx, &mut shutdown_rx).await;
        });
        *self.task.lock() = Some(handle);

        Ok(())
    }

    /// Stop watching: flush the buffer, then release OS resources
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Watcher task join failed");
            }
        }
        *self.os_watcher.lock() = None;
        info!(project = %self.project.display_name, "Watcher stopped");
    }

    /// Queue a change as if the OS had reported it (used by the HTTP
    /// `/queue-file-change` endpoint)
    pub fn queue_file_change(&self, path: PathBuf, change: ChangeType) {
        let mut buffer = self.shared.buffer.lock();
        let now = Instant::now();
        buffer
            .entry(path)
            .and_modify(|pending| {
                pending.change = pending.change.coalesce(change);
                pending.last_seen = now;
            })
            .or_insert(PendingChange {
                change,
                first_seen: now,
                last_seen: now,
            });
    }

    /// Current snapshot for introspection
    #[must_use]
    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            project_id: self.project.id,
            root: self.project.path.clone(),
            running: self.running.load(Ordering::SeqCst),
            pending_edits: self.shared.buffer.lock().len(),
            flushes: self.shared.flushes.load(Ordering::SeqCst),
        }
    }

    /// The project this watcher serves
    #[must_use]
    pub fn project(&self) -> &Project {
        &self.project
    }

    async fn run_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<(PathBuf, ChangeType)>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some((path, change)) => self.queue_file_change(path, change),
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    if self.should_flush() {
                        self.flush().await;
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        // Final flush so buffered edits survive shutdown.
        self.flush().await;
    }

    fn should_flush(&self) -> bool {
        let buffer = self.shared.buffer.lock();
        if buffer.is_empty() {
            return false;
        }
        let now = Instant::now();
        let newest = buffer.values().map(|p| p.last_seen).max();
        let oldest = buffer.values().map(|p| p.first_seen).min();
        matches!(newest, Some(t) if now.duration_since(t) >= self.config.debounce)
            || matches!(oldest, Some(t) if now.duration_since(t) >= self.config.max_tail)
    }

    async fn flush(&self) {
        let drained: Vec<(PathBuf, ChangeType)> = {
            let mut buffer = self.shared.buffer.lock();
            buffer.drain().map(|(p, c)| (p, c.change)).collect()
        };
        if drained.is_empty() {
            return;
        }

        let mut changed = std::collections::HashSet::new();
        let mut deleted = Vec::new();
        for (path, change) in drained {
            match change {
                ChangeType::Deleted => {
                    let rel = path
                        .strip_prefix(&self.project.path)
                        .unwrap_or(&path)
                        .to_path_buf();
                    deleted.push(rel);
                }
                ChangeType::Created | ChangeType::Updated => {
                    changed.insert(path);
                }
            }
        }

        debug!(
            changed = changed.len(),
            deleted = deleted.len(),
            "Flushing watcher buffer"
        );
        let changed = if changed.is_empty() { None } else { Some(changed) };
        if let Err(e) = self.run_ingestion(changed, deleted).await {
            error!(error = %e, "Watcher ingestion failed; changes stay queued for rescan");
        }
        self.shared.flushes.fetch_add(1, Ordering::SeqCst);
    }

    async fn run_ingestion(
        &self,
        changed: Option<std::collections::HashSet<PathBuf>>,
        deleted: Vec<PathBuf>,
    ) -> Result<IngestReport> {
        let request = ParseRequest {
            root: self.project.path.clone(),
            include: self.project.include_globs.clone(),
            exclude: self.project.exclude_globs.clone(),
            changed,
        };

        let delta = self.parser.parse(&request).await?;
        let report = self.ingestor.ingest(delta, &deleted).await?;

        if !report.is_empty() {
            if let Some(hook) = &self.hook {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    hook(&report);
                }));
                if result.is_err() {
                    warn!("after-ingestion hook panicked; ignored");
                }
            }
        }
        Ok(report)
    }
}

fn classify(kind: &EventKind) -> Option<ChangeType> {
    match kind {
        EventKind::Create(_) => Some(ChangeType::Created),
        EventKind::Modify(_) => Some(ChangeType::Updated),
        EventKind::Remove(_) => Some(ChangeType::Deleted),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope_parser::ScopeParser;
    use codebrain_core::LockRegistry;
    use codebrain_graph::{GraphStore, MemoryGraphStore};
    use std::sync::atomic::AtomicUsize;

    fn fixture(root: &Path) -> (Arc<MemoryGraphStore>, Arc<FileWatcher>, Arc<AtomicUsize>) {
        let store = Arc::new(MemoryGraphStore::new());
        let ingestor = Arc::new(IncrementalIngestor::new(
            Arc::clone(&store) as Arc<dyn GraphStore>,
            Arc::new(LockRegistry::new()),
        ));
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook: AfterIngestionHook = {
            let calls = Arc::clone(&hook_calls);
            Arc::new(move |_report| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        let project = Project::new(
            root.to_path_buf(),
            vec!["**/*.rs".to_string()],
            vec![],
        );
        let watcher = Arc::new(FileWatcher::new(
            project,
            Arc::new(ScopeParser::new()),
            ingestor,
            WatcherConfig {
                debounce: Duration::from_millis(50),
                max_tail: Duration::from_millis(500),
            },
            Some(hook),
        ));
        (store, watcher, hook_calls)
    }

    #[tokio::test]
    async fn test_queue_coalesces_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, watcher, _hook) = fixture(tmp.path());
        let path = tmp.path().join("x.rs");

        watcher.queue_file_change(path.clone(), ChangeType::Created);
        watcher.queue_file_change(path.clone(), ChangeType::Updated);
        watcher.queue_file_change(path.clone(), ChangeType::Updated);

        let buffer = watcher.shared.buffer.lock();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[&path].change, ChangeType::Created);
    }

    #[tokio::test]
    async fn test_delete_wins_coalescing() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, watcher, _hook) = fixture(tmp.path());
        let path = tmp.path().join("x.rs");

        watcher.queue_file_change(path.clone(), ChangeType::Updated);
        watcher.queue_file_change(path.clone(), ChangeType::Deleted);

        assert_eq!(
            watcher.shared.buffer.lock()[&path].change,
            ChangeType::Deleted
        );
    }

    #[tokio::test]
    async fn test_flush_ingests_once_and_fires_hook() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.rs"), "fn touched() {}\n").unwrap();
        let (store, watcher, hook_calls) = fixture(tmp.path());

        // Five rapid edits to the same file within the debounce window.
        for _ in 0..5 {
            watcher.queue_file_change(tmp.path().join("x.rs"), ChangeType::Updated);
        }
        watcher.flush().await;

        assert_eq!(store.node_count("File"), 1);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.status().pending_edits, 0);
        assert_eq!(watcher.status().flushes, 1);
    }

    #[tokio::test]
    async fn test_startup_rescan_ingests_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pre.rs"), "fn already_there() {}\n").unwrap();
        let (store, watcher, _hook) = fixture(tmp.path());

        Arc::clone(&watcher).start().await.unwrap();
        assert_eq!(store.node_count("File"), 1);

        watcher.stop().await;
        assert!(!watcher.status().running);
    }

    #[tokio::test]
    async fn test_double_start_collapses() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, watcher, _hook) = fixture(tmp.path());

        Arc::clone(&watcher).start().await.unwrap();
        Arc::clone(&watcher).start().await.unwrap();
        assert!(watcher.status().running);
        watcher.stop().await;
    }
}
