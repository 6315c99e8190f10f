//! Incremental application of parser deltas to the graph
//!
//! The whole run holds the ingestion lock. Removals go first so a rename
//! never leaves a stale file node; node upserts follow in a fixed label
//! order so edges always find their endpoints; edges are grouped per
//! `(type, from-label, to-label)`; finally every touched Scope and File is
//! flagged dirty for the embedding pipeline.
//!
//! Each batch is independent and idempotent under MERGE, so a retried or
//! half-failed run leaves the graph consistent: the next run simply
//! re-merges.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::delta::{keys, GraphDelta};
use crate::error::{IngestError, Result};
use codebrain_core::{LockRegistry, INGESTION_LOCK};
use codebrain_graph::{EdgeRow, GraphStore, KeySpec, UpsertStats};

/// Upper bound on rows per database round trip
const BATCH_SIZE: usize = 500;
/// Attempts per batch before the ingestion fails
const MAX_ATTEMPTS: usize = 3;
/// Backoff before the 2nd and 3rd attempt
const BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

/// Label order for node upserts; containers before contents
const LABEL_ORDER: [&str; 5] = [
    "Directory",
    "File",
    "Project",
    "ExternalLibrary",
    "Scope",
];

/// Outcome of one ingestion call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

impl IngestReport {
    /// Whether the run touched the graph at all
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Applies deltas to a `GraphStore` under the ingestion lock
pub struct IncrementalIngestor {
    graph: Arc<dyn GraphStore>,
    locks: Arc<LockRegistry>,
}

impl IncrementalIngestor {
    /// Create an ingestor bound to a store and the daemon's lock registry
    #[must_use]
    pub fn new(graph: Arc<dyn GraphStore>, locks: Arc<LockRegistry>) -> Self {
        Self { graph, locks }
    }

    /// Apply one delta plus a set of removed files
    ///
    /// # Errors
    ///
    /// Returns `IngestError::BatchExhausted` when a batch keeps failing
    /// after retries; earlier successful batches remain applied.
    pub async fn ingest(&self, delta: GraphDelta, removed: &[PathBuf]) -> Result<IngestReport> {
        let description = format!(
            "ingest: {} nodes, {} edges, {} removals",
            delta.nodes.len(),
            delta.edges.len(),
            removed.len()
        );
        let _lock = self.locks.acquire(INGESTION_LOCK, description);

        let mut report = IngestReport::default();

        // 1. Removals, cascading to attached scopes.
        for path in removed {
            let rel = path.to_string_lossy().replace('\\', "/");
            let deleted = self
                .retry("delete file", || {
                    let graph = Arc::clone(&self.graph);
                    let value = json!(rel);
                    async move { graph.delete_by_key("File", "path", &value, true).await }
                })
                .await?;
            report.removed += deleted;
        }

        // 2. Node upserts in label order.
        let mut by_label: BTreeMap<&str, Vec<Map<String, Value>>> = BTreeMap::new();
        let mut dirty_scopes = Vec::new();
        let mut dirty_files = Vec::new();
        for node in &delta.nodes {
            by_label
                .entry(node.label.as_str())
                .or_default()
                .push(node.properties.clone());
            match node.label.as_str() {
                "Scope" => {
                    if let Some(uuid) = node.properties.get("uuid") {
                        dirty_scopes.push(uuid.clone());
                    }
                }
                "File" => {
                    if let Some(path) = node.properties.get("path") {
                        dirty_files.push(path.clone());
                    }
                }
                _ => {}
            }
        }

        for label in LABEL_ORDER {
            let Some(rows) = by_label.remove(label) else {
                continue;
            };
            let key_field = key_field_for(label);
            for batch in rows.chunks(BATCH_SIZE) {
                let stats: UpsertStats = self
                    .retry("upsert nodes", || {
                        let graph = Arc::clone(&self.graph);
                        let batch = batch.to_vec();
                        async move { graph.upsert_nodes(label, key_field, batch).await }
                    })
                    .await?;
                report.created += stats.created;
                report.updated += stats.updated;
            }
        }
        if let Some((label, _)) = by_label.into_iter().next() {
            warn!(label, "Delta contained nodes of an unknown label; skipped");
        }

        // 3. Edges grouped by (type, from-label, to-label).
        let mut edge_groups: BTreeMap<(String, String, String), Vec<EdgeRow>> = BTreeMap::new();
        for edge in &delta.edges {
            let (Some((from_ns, from_key)), Some((to_ns, to_key))) =
                (keys::split(&edge.from), keys::split(&edge.to))
            else {
                warn!(from = %edge.from, to = %edge.to, "Edge with unnamespaced key; skipped");
                continue;
            };
            edge_groups
                .entry((
                    edge.edge_type.clone(),
                    from_ns.to_string(),
                    to_ns.to_string(),
                ))
                .or_default()
                .push(EdgeRow {
                    from: json!(from_key),
                    to: json!(to_key),
                    properties: edge.properties.clone(),
                });
        }

        for ((edge_type, from_ns, to_ns), rows) in edge_groups {
            let (Some(from_spec), Some(to_spec)) = (spec_for(&from_ns), spec_for(&to_ns)) else {
                warn!(edge_type, from_ns, to_ns, "Edge with unknown namespace; skipped");
                continue;
            };
            for batch in rows.chunks(BATCH_SIZE) {
                self.retry("upsert edges", || {
                    let graph = Arc::clone(&self.graph);
                    let batch = batch.to_vec();
                    let from_spec = from_spec.clone();
                    let to_spec = to_spec.clone();
                    let edge_type = edge_type.clone();
                    async move {
                        graph
                            .upsert_edges(&edge_type, &from_spec, &to_spec, batch)
                            .await
                    }
                })
                .await?;
            }
        }

        // 4. Flag everything touched for re-embedding.
        if !dirty_scopes.is_empty() {
            self.retry("mark scopes dirty", || {
                let graph = Arc::clone(&self.graph);
                let values = dirty_scopes.clone();
                async move { graph.mark_dirty("Scope", "uuid", &values).await }
            })
            .await?;
        }
        if !dirty_files.is_empty() {
            self.retry("mark files dirty", || {
                let graph = Arc::clone(&self.graph);
                let values = dirty_files.clone();
                async move { graph.mark_dirty("File", "path", &values).await }
            })
            .await?;
        }

        info!(
            created = report.created,
            updated = report.updated,
            removed = report.removed,
            "Ingestion complete"
        );
        Ok(report)
    }

    async fn retry<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = codebrain_graph::Result<T>>,
    {
        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFFS[attempt - 1];
                debug!(what, attempt, "Retrying batch after {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(what, attempt, error = %e, "Batch attempt failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(IngestError::BatchExhausted {
            attempts: MAX_ATTEMPTS,
            message: format!("{what}: {last_error}"),
        })
    }
}

fn key_field_for(label: &str) -> &'static str {
    match label {
        "Scope" => "uuid",
        "ExternalLibrary" => "name",
        _ => "path",
    }
}

fn spec_for(namespace: &str) -> Option<KeySpec> {
    match namespace {
        "file" => Some(KeySpec::new("File", "path")),
        "dir" => Some(KeySpec::new("Directory", "path")),
        "scope" => Some(KeySpec::new("Scope", "uuid")),
        "lib" => Some(KeySpec::new("ExternalLibrary", "name")),
        "project" => Some(KeySpec::new("Project", "path")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{EdgeSpec, NodeSpec};
    use codebrain_graph::MemoryGraphStore;

    fn file_node(path: &str) -> NodeSpec {
        NodeSpec {
            key: keys::file(path),
            label: "File".to_string(),
            properties: [
                ("path".to_string(), json!(path)),
                ("content".to_string(), json!("fn x() {}")),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn scope_node(uuid: &str, parent: &str) -> NodeSpec {
        NodeSpec {
            key: keys::scope(uuid),
            label: "Scope".to_string(),
            properties: [
                ("uuid".to_string(), json!(uuid)),
                ("content".to_string(), json!("fn x() {}")),
                ("parent".to_string(), json!(parent)),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn fixture() -> (Arc<MemoryGraphStore>, Arc<LockRegistry>, IncrementalIngestor) {
        let store = Arc::new(MemoryGraphStore::new());
        let locks = Arc::new(LockRegistry::new());
        let ingestor = IncrementalIngestor::new(
            Arc::clone(&store) as Arc<dyn GraphStore>,
            Arc::clone(&locks),
        );
        (store, locks, ingestor)
    }

    fn sample_delta() -> GraphDelta {
        GraphDelta {
            nodes: vec![
                file_node("src/a.rs"),
                scope_node("src/a.rs::x", "src/a.rs"),
            ],
            edges: vec![EdgeSpec {
                edge_type: "CONTAINS_SCOPE".to_string(),
                from: keys::file("src/a.rs"),
                to: keys::scope("src/a.rs::x"),
                properties: Map::new(),
            }],
            files_processed: 1,
            stats: crate::delta::ParseStats::default(),
        }
    }

    #[tokio::test]
    async fn test_ingest_creates_then_updates() {
        let (store, _locks, ingestor) = fixture();

        let first = ingestor.ingest(sample_delta(), &[]).await.unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.removed, 0);
        assert_eq!(store.edge_count(), 1);

        // Ingesting the identical delta again must not create anything.
        let second = ingestor.ingest(sample_delta(), &[]).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_ingest_marks_dirty() {
        let (store, _locks, ingestor) = fixture();
        ingestor.ingest(sample_delta(), &[]).await.unwrap();

        let scope = store.get_node("Scope", "src/a.rs::x").unwrap();
        assert_eq!(scope["dirty"], json!(true));
        let file = store.get_node("File", "src/a.rs").unwrap();
        assert_eq!(file["dirty"], json!(true));
    }

    #[tokio::test]
    async fn test_removed_files_cascade() {
        let (store, _locks, ingestor) = fixture();
        ingestor.ingest(sample_delta(), &[]).await.unwrap();

        let report = ingestor
            .ingest(GraphDelta::default(), &[PathBuf::from("src/a.rs")])
            .await
            .unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(store.node_count("File"), 0);
        assert_eq!(store.node_count("Scope"), 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_ingest() {
        let (_store, locks, ingestor) = fixture();
        ingestor.ingest(sample_delta(), &[]).await.unwrap();
        assert!(!locks.is_locked(INGESTION_LOCK));
    }
}
