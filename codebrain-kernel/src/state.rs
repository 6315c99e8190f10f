//! Shared daemon state
//!
//! `DaemonState` owns the lock registry, the lifecycle, the tool
//! registry, personas, the project/watcher registries, and, lazily,
//! the "brain": every component that needs a live graph connection.
//! Handlers call `ensure_brain()` on first need; it is idempotent and
//! connects exactly once.

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lifecycle::{human_uptime, Lifecycle};
use crate::logsink::LogSink;
use crate::personas::PersonaStore;
use codebrain_agents::CompletionModel;
use codebrain_config::{BrainConfig, ConfigDir};
use codebrain_context::ContextBuilder;
use codebrain_core::{ChangeType, LockRegistry, Project, VectorIndexDef, EMBEDDING_LOCK, INGESTION_LOCK};
use codebrain_embeddings::{EmbeddingModel, EmbeddingPipeline, LocalHashEmbedding, OpenAiEmbedding};
use codebrain_graph::{schema, GraphStore, Neo4jStore};
use codebrain_ingest::{
    AfterIngestionHook, FileWatcher, IncrementalIngestor, ScopeParser, SourceParser, WatcherConfig,
    WatcherStatus,
};
use codebrain_memory::{
    ConversationStore, ConversationSummarizer, HierarchicalSummarizer, MemoryConfig, SummaryText,
};
use codebrain_tools::ToolRegistry;

/// Name of the summary vector index
pub const SUMMARY_INDEX: &str = "summary_embedding_index";

/// Everything that needs a live graph connection
pub struct Brain {
    pub graph: Arc<dyn GraphStore>,
    pub parser: Arc<dyn SourceParser>,
    pub ingestor: Arc<IncrementalIngestor>,
    pub embedder: Option<Arc<dyn EmbeddingModel>>,
    pub pipeline: Option<Arc<EmbeddingPipeline>>,
    pub conversations: Arc<ConversationStore>,
    pub context: Option<Arc<ContextBuilder>>,
    /// Vector indexes registered at startup, embeddable entities first
    pub vector_indexes: Vec<VectorIndexDef>,
}

/// Process-wide daemon state
pub struct DaemonState {
    pub config: BrainConfig,
    pub config_dir: ConfigDir,
    pub locks: Arc<LockRegistry>,
    pub lifecycle: Arc<Lifecycle>,
    pub log_sink: Arc<LogSink>,
    pub personas: PersonaStore,
    pub tools: Arc<ToolRegistry>,
    pub memory_config: MemoryConfig,
    projects: DashMap<PathBuf, Project>,
    watchers: DashMap<Uuid, Arc<FileWatcher>>,
    brain: OnceCell<Arc<Brain>>,
    /// Test injection point; production connects per config
    graph_override: Option<Arc<dyn GraphStore>>,
    completion: Option<Arc<dyn CompletionModel>>,
    /// Self-reference for hooks spawned off the watcher path
    self_weak: std::sync::Weak<DaemonState>,
}

impl DaemonState {
    /// Create production state; nothing connects until first use
    #[must_use]
    pub fn new(config: BrainConfig, config_dir: ConfigDir, log_sink: Arc<LogSink>) -> Arc<Self> {
        let locks = Arc::new(LockRegistry::new());
        let lifecycle = Lifecycle::new(std::time::Duration::from_secs(
            config.daemon.idle_timeout_secs,
        ));
        let completion = build_completion();
        Arc::new_cyclic(|weak| Self {
            tools: Arc::new(ToolRegistry::new(Arc::clone(&locks))),
            locks,
            lifecycle,
            log_sink,
            personas: PersonaStore::new(),
            memory_config: MemoryConfig::default(),
            projects: DashMap::new(),
            watchers: DashMap::new(),
            brain: OnceCell::new(),
            graph_override: None,
            completion,
            self_weak: weak.clone(),
            config,
            config_dir,
        })
    }

    /// Test state over an injected graph backend and completion model
    #[must_use]
    pub fn for_tests(
        config: BrainConfig,
        config_dir: ConfigDir,
        log_sink: Arc<LogSink>,
        graph: Arc<dyn GraphStore>,
        completion: Option<Arc<dyn CompletionModel>>,
    ) -> Arc<Self> {
        let locks = Arc::new(LockRegistry::new());
        let lifecycle = Lifecycle::new(std::time::Duration::from_secs(
            config.daemon.idle_timeout_secs,
        ));
        Arc::new_cyclic(|weak| Self {
            tools: Arc::new(ToolRegistry::new(Arc::clone(&locks))),
            locks,
            lifecycle,
            log_sink,
            personas: PersonaStore::new(),
            memory_config: MemoryConfig::default(),
            projects: DashMap::new(),
            watchers: DashMap::new(),
            brain: OnceCell::new(),
            graph_override: Some(graph),
            completion,
            self_weak: weak.clone(),
            config,
            config_dir,
        })
    }

    /// The completion model, when one is configured
    #[must_use]
    pub fn completion(&self) -> Option<Arc<dyn CompletionModel>> {
        self.completion.clone()
    }

    /// Lazily connect the graph and build every graph-backed component
    ///
    /// # Errors
    ///
    /// Connection and schema failures propagate; schema rejection is
    /// fatal to the daemon.
    pub async fn ensure_brain(&self) -> Result<Arc<Brain>> {
        self.brain
            .get_or_try_init(|| async { self.build_brain().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Whether the graph has been connected yet
    #[must_use]
    pub fn brain_connected(&self) -> bool {
        self.brain.initialized()
    }

    async fn build_brain(&self) -> Result<Brain> {
        let graph: Arc<dyn GraphStore> = if let Some(graph) = &self.graph_override {
            Arc::clone(graph)
        } else {
            let neo4j = &self.config.neo4j;
            Arc::new(
                Neo4jStore::connect(
                    &neo4j.uri,
                    &neo4j.username,
                    &neo4j.password,
                    &neo4j.database,
                )
                .await
                .context("Failed to connect to the graph database")?,
            )
        };

        let vector_indexes = self.vector_index_defs();
        graph
            .ensure_schema(
                &schema::core_constraints(),
                &schema::core_indexes(),
                &vector_indexes,
            )
            .await
            .context("Schema rejected by the graph database")?;

        let embedder = self.build_embedder();
        let pipeline = embedder.as_ref().map(|model| {
            Arc::new(EmbeddingPipeline::new(
                Arc::clone(&graph),
                Arc::clone(&self.locks),
                Arc::clone(model),
            ))
        });

        let summarizer = self.completion.as_ref().map(|model| {
            Arc::new(HierarchicalSummarizer::new(
                Arc::clone(&graph),
                Arc::new(CompletionSummarizer(Arc::clone(model))),
                embedder.clone(),
                self.memory_config.clone(),
            ))
        });
        let mut conversations = ConversationStore::new(Arc::clone(&graph));
        if let Some(summarizer) = summarizer {
            conversations = conversations.with_summarizer(summarizer);
        }
        let conversations = Arc::new(conversations);

        let context = embedder.as_ref().map(|model| {
            Arc::new(ContextBuilder::new(
                Arc::clone(&graph),
                Arc::clone(&conversations),
                Arc::clone(&self.locks),
                Some(Arc::clone(model)),
                self.memory_config.clone(),
                SUMMARY_INDEX,
            ))
        });

        info!("Brain initialized");
        Ok(Brain {
            parser: Arc::new(ScopeParser::new()),
            ingestor: Arc::new(IncrementalIngestor::new(
                Arc::clone(&graph),
                Arc::clone(&self.locks),
            )),
            embedder,
            pipeline,
            conversations,
            context,
            vector_indexes,
            graph,
        })
    }

    fn vector_index_defs(&self) -> Vec<VectorIndexDef> {
        let defaults = &self.config.embeddings.defaults;
        let mut indexes: Vec<VectorIndexDef> = self
            .config
            .entities
            .iter()
            .filter_map(|entity| {
                let overrides = self.config.embeddings.entities.get(&entity.label);
                let source_field = overrides
                    .and_then(|o| o.source_field.clone())
                    .or_else(|| entity.content_field.clone())?;
                Some(VectorIndexDef {
                    name: format!("{}_embedding_index", entity.label.to_lowercase()),
                    node_label: entity.label.clone(),
                    source_field,
                    dimension: overrides
                        .and_then(|o| o.dimension)
                        .unwrap_or(defaults.dimension),
                    provider: defaults.provider.clone(),
                    model: overrides
                        .and_then(|o| o.model.clone())
                        .unwrap_or_else(|| defaults.model.clone()),
                })
            })
            .collect();

        indexes.push(VectorIndexDef {
            name: SUMMARY_INDEX.to_string(),
            node_label: "Summary".to_string(),
            source_field: "combined".to_string(),
            dimension: defaults.dimension,
            provider: defaults.provider.clone(),
            model: defaults.model.clone(),
        });
        indexes
    }

    fn build_embedder(&self) -> Option<Arc<dyn EmbeddingModel>> {
        let defaults = &self.config.embeddings.defaults;
        match defaults.provider.as_str() {
            "local" => Some(Arc::new(LocalHashEmbedding::new(defaults.dimension))),
            "openai" => {
                match OpenAiEmbedding::new(&defaults.model, defaults.dimension, "OPENAI_API_KEY", None)
                {
                    Ok(model) => Some(Arc::new(model)),
                    Err(e) => {
                        warn!(error = %e, "Embeddings disabled");
                        None
                    }
                }
            }
            other => {
                warn!(provider = other, "Unknown embedding provider; embeddings disabled");
                None
            }
        }
    }

    /// Register a project and start its watcher (idempotent per path)
    ///
    /// # Errors
    ///
    /// Watcher registration failures propagate.
    pub async fn register_project(
        &self,
        path: PathBuf,
        include: Vec<String>,
        exclude: Vec<String>,
    ) -> Result<Project> {
        if let Some(existing) = self.projects.get(&path) {
            return Ok(existing.clone());
        }
        let brain = self.ensure_brain().await?;

        let project = Project::new(path.clone(), include, exclude);
        let hook = self.after_ingestion_hook();
        let watcher = Arc::new(FileWatcher::new(
            project.clone(),
            Arc::clone(&brain.parser),
            Arc::clone(&brain.ingestor),
            WatcherConfig::default(),
            Some(hook),
        ));
        Arc::clone(&watcher)
            .start()
            .await
            .context("Failed to start watcher")?;

        // Watchers are stored by project id directly.
        self.watchers.insert(project.id, watcher);
        self.projects.insert(path, project.clone());
        info!(project = %project.display_name, "Project registered");
        Ok(project)
    }

    /// Remove a project and stop its watcher
    pub async fn unregister_project(&self, path: &Path) -> Option<Project> {
        let (_, project) = self.projects.remove(path)?;
        if let Some((_, watcher)) = self.watchers.remove(&project.id) {
            watcher.stop().await;
        }
        Some(project)
    }

    /// Registered projects
    #[must_use]
    pub fn projects(&self) -> Vec<Project> {
        self.projects.iter().map(|e| e.value().clone()).collect()
    }

    /// Watcher snapshots for `/watchers`
    #[must_use]
    pub fn watcher_statuses(&self) -> Vec<WatcherStatus> {
        self.watchers.iter().map(|e| e.value().status()).collect()
    }

    /// Stop every watcher (drain path)
    pub async fn stop_watchers(&self) {
        for entry in self.watchers.iter() {
            entry.value().stop().await;
        }
    }

    /// Route an externally reported file change to the owning watcher
    ///
    /// Returns false when no registered project contains the path.
    #[must_use]
    pub fn queue_file_change(&self, path: &Path, change: ChangeType) -> bool {
        for entry in self.watchers.iter() {
            if path.starts_with(&entry.value().project().path) {
                entry
                    .value()
                    .queue_file_change(path.to_path_buf(), change);
                return true;
            }
        }
        false
    }

    /// Embed all dirty nodes across registered indexes
    ///
    /// # Errors
    ///
    /// Pipeline failures propagate; missing embedder is an error the
    /// caller can surface.
    pub async fn embed_dirty(&self) -> Result<serde_json::Value> {
        let brain = self.ensure_brain().await?;
        let Some(pipeline) = &brain.pipeline else {
            anyhow::bail!("no embedding provider configured");
        };

        let mut reports = Vec::new();
        for index in &brain.vector_indexes {
            if index.node_label == "Summary" {
                // Summary vectors are written at creation time.
                continue;
            }
            let key_field = if index.node_label == "Scope" { "uuid" } else { "path" };
            let request =
                codebrain_embeddings::EmbedRequest::dirty(index.clone(), key_field);
            let report = pipeline.run(&request).await?;
            reports.push(json!({
                "index": index.name,
                "total": report.total,
                "succeeded": report.succeeded,
                "failed": report.failed,
                "duration_ms": report.duration_ms,
            }));
        }
        Ok(json!({"reports": reports}))
    }

    fn after_ingestion_hook(&self) -> AfterIngestionHook {
        let state = self.self_weak.clone();
        Arc::new(move |report| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let counts = (report.created, report.updated, report.removed);
            // Embedding happens off the watcher's flush path.
            tokio::spawn(async move {
                info!(
                    created = counts.0,
                    updated = counts.1,
                    removed = counts.2,
                    "Ingestion finished; embedding dirty nodes"
                );
                if let Err(e) = state.embed_dirty().await {
                    warn!(error = %e, "Post-ingestion embedding failed");
                }
            });
        })
    }

    /// The `/status` document
    #[must_use]
    pub fn status_json(&self) -> serde_json::Value {
        let uptime_ms = self.lifecycle.uptime_ms();
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_process(pid);
        let (rss_mb, heap_used_mb) = system.process(pid).map_or((0, 0), |p| {
            (p.memory() / (1024 * 1024), p.virtual_memory() / (1024 * 1024))
        });

        let pending_edits: usize = self
            .watcher_statuses()
            .iter()
            .map(|w| w.pending_edits)
            .sum();

        json!({
            "status": self.lifecycle.phase(),
            "pid": std::process::id(),
            "port": self.config.daemon.port,
            "uptime_ms": uptime_ms,
            "uptime_human": human_uptime(uptime_ms),
            "started_at": self.lifecycle.started_at().to_rfc3339(),
            "last_activity": self.lifecycle.last_activity().to_rfc3339(),
            "request_count": self.lifecycle.request_count(),
            "idle_timeout_ms": self.lifecycle.idle_timeout().as_millis() as u64,
            "brain": {
                "connected": self.brain_connected(),
                "projects": self.projects.len(),
                "watchers": self.watchers.len(),
                "ingestion_status": self.locks.get_status(INGESTION_LOCK),
                "embedding_status": self.locks.get_status(EMBEDDING_LOCK),
                "pending_edits": pending_edits,
                "brain_path": self.config_dir.root().display().to_string(),
                "config": {"name": self.config.name, "version": self.config.version},
            },
            "tools": {"count": self.tools.count()},
            "memory": {"rss_mb": rss_mb, "heap_used_mb": heap_used_mb},
        })
    }
}

/// Adapts the agent completion model to the summarizer seam
struct CompletionSummarizer(Arc<dyn CompletionModel>);

#[async_trait::async_trait]
impl ConversationSummarizer for CompletionSummarizer {
    async fn summarize(&self, transcript: &str) -> codebrain_memory::Result<SummaryText> {
        let prompt = codebrain_memory::summarizer::summarization_prompt(transcript);
        let response = self
            .0
            .complete(&prompt)
            .await
            .map_err(|e| codebrain_memory::MemoryError::Summarizer(e.to_string()))?;
        Ok(split_summary_response(&response))
    }
}

/// Split an LLM summary response into its two blocks
///
/// Tolerates missing markers by halving the text.
fn split_summary_response(response: &str) -> SummaryText {
    let upper = response.to_uppercase();
    if let (Some(conv_at), Some(act_at)) = (upper.find("CONVERSATION"), upper.find("ACTIONS")) {
        if conv_at < act_at {
            let conversation = response[conv_at..act_at]
                .trim_start_matches(|c: char| c != ':')
                .trim_start_matches(':')
                .trim()
                .to_string();
            let actions = response[act_at..]
                .trim_start_matches(|c: char| c != ':')
                .trim_start_matches(':')
                .trim()
                .to_string();
            return SummaryText {
                conversation_summary: conversation,
                actions_summary: actions,
            };
        }
    }
    let mid = response.len() / 2;
    let mid = response
        .char_indices()
        .map(|(i, _)| i)
        .min_by_key(|i| i.abs_diff(mid))
        .unwrap_or(0);
    SummaryText {
        conversation_summary: response[..mid].trim().to_string(),
        actions_summary: response[mid..].trim().to_string(),
    }
}

fn build_completion() -> Option<Arc<dyn CompletionModel>> {
    match codebrain_agents::OpenAiChatModel::new("gpt-4o-mini", "OPENAI_API_KEY", None) {
        Ok(model) => Some(Arc::new(model)),
        Err(e) => {
            warn!(error = %e, "No completion provider; agent and summarization disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codebrain_graph::MemoryGraphStore;

    fn test_state(dir: &Path) -> Arc<DaemonState> {
        let mut config = BrainConfig::default();
        config.embeddings.defaults.provider = "local".to_string();
        config.embeddings.defaults.dimension = 32;
        let sink = LogSink::open(dir.join("logs/daemon.log"), false).unwrap();
        DaemonState::for_tests(
            config,
            ConfigDir::at(dir.to_path_buf()),
            sink,
            Arc::new(MemoryGraphStore::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_ensure_brain_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        assert!(!state.brain_connected());
        let first = state.ensure_brain().await.unwrap();
        let second = state.ensure_brain().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(state.brain_connected());
    }

    #[tokio::test]
    async fn test_register_project_starts_watcher() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.rs"), "fn a() {}\n").unwrap();

        let state = test_state(tmp.path());
        let project = state
            .register_project(
                source.path().to_path_buf(),
                vec!["**/*.rs".to_string()],
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(state.projects().len(), 1);
        let statuses = state.watcher_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].project_id, project.id);
        assert!(statuses[0].running);

        // Same path again collapses to the existing registration.
        let again = state
            .register_project(source.path().to_path_buf(), vec![], vec![])
            .await
            .unwrap();
        assert_eq!(again.id, project.id);

        state.stop_watchers().await;
    }

    #[tokio::test]
    async fn test_queue_file_change_routes_by_root() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        state
            .register_project(source.path().to_path_buf(), vec![], vec![])
            .await
            .unwrap();

        assert!(state.queue_file_change(&source.path().join("x.rs"), ChangeType::Updated));
        assert!(!state.queue_file_change(Path::new("/elsewhere/x.rs"), ChangeType::Updated));
        state.stop_watchers().await;
    }

    #[tokio::test]
    async fn test_status_json_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        state.lifecycle.mark_ready();
        state.lifecycle.touch();

        let status = state.status_json();
        assert_eq!(status["status"], json!("ready"));
        assert_eq!(status["request_count"], json!(1));
        assert_eq!(status["brain"]["connected"], json!(false));
        assert!(status["uptime_human"].is_string());
        assert!(status["memory"]["rss_mb"].is_u64());
    }

    #[test]
    fn test_split_summary_response() {
        let text = split_summary_response(
            "CONVERSATION: talked about locks\nACTIONS: ran three searches",
        );
        assert_eq!(text.conversation_summary, "talked about locks");
        assert_eq!(text.actions_summary, "ran three searches");

        let fallback = split_summary_response("just some text with no markers");
        assert!(!fallback.conversation_summary.is_empty());
        assert!(!fallback.actions_summary.is_empty());
    }
}
