//! The dirty-node embedding pipeline
//!
//! One run: wait for ingestion to drain, take the embedding lock, select
//! target nodes, build texts per combine strategy, embed in concurrent
//! batches, write vectors back and clear the dirty flags of the nodes
//! that succeeded. Nodes in failed batches keep their dirty flag and are
//! picked up by the next run.

use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{EmbeddingError, Result};
use crate::provider::EmbeddingModel;
use codebrain_core::{LockRegistry, VectorIndexDef, EMBEDDING_LOCK, INGESTION_LOCK};
use codebrain_graph::GraphStore;

/// Provider retry schedule inside one batch
const BATCH_BACKOFFS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// How source fields are merged into embedding text
#[derive(Debug, Clone)]
pub enum CombineStrategy {
    /// Join all fields into one text
    Concat,
    /// Join fields, repeating each by its (rounded) weight
    Weighted(Vec<f32>),
    /// Embed every field separately into its own `<field>_embedding`
    Separate,
}

/// One embedding run request
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    /// Index describing label, source field, and model
    pub index: VectorIndexDef,
    /// Key field of the indexed label (`uuid` for scopes, `path` for files)
    pub key_field: String,
    /// Extra source fields beyond the index's own, if any
    pub extra_fields: Vec<String>,
    /// Restrict to dirty nodes
    pub only_dirty: bool,
    /// Combine strategy over the source fields
    pub strategy: CombineStrategy,
    /// Texts per provider call
    pub batch_size: usize,
    /// Concurrent provider calls
    pub concurrency: usize,
}

impl EmbedRequest {
    /// Standard dirty-only request for one index
    #[must_use]
    pub fn dirty(index: VectorIndexDef, key_field: &str) -> Self {
        Self {
            index,
            key_field: key_field.to_string(),
            extra_fields: Vec::new(),
            only_dirty: true,
            strategy: CombineStrategy::Concat,
            batch_size: 50,
            concurrency: 10,
        }
    }

    fn source_fields(&self) -> Vec<String> {
        let mut fields = vec![self.index.source_field.clone()];
        fields.extend(self.extra_fields.iter().cloned());
        fields
    }
}

/// Outcome of one embedding run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Walks dirty nodes and writes their vectors back
pub struct EmbeddingPipeline {
    graph: Arc<dyn GraphStore>,
    locks: Arc<LockRegistry>,
    model: Arc<dyn EmbeddingModel>,
    /// How long to wait for ingestion to drain before giving up
    drain_timeout: Duration,
}

impl EmbeddingPipeline {
    /// Create a pipeline bound to a store, the lock registry, and a model
    #[must_use]
    pub fn new(
        graph: Arc<dyn GraphStore>,
        locks: Arc<LockRegistry>,
        model: Arc<dyn EmbeddingModel>,
    ) -> Self {
        Self {
            graph,
            locks,
            model,
            drain_timeout: Duration::from_secs(600),
        }
    }

    /// Override the ingestion drain budget
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Run one embedding pass
    ///
    /// # Errors
    ///
    /// Fails if ingestion does not drain in time or target selection
    /// fails; individual batch failures are counted, not raised.
    pub async fn run(&self, request: &EmbedRequest) -> Result<EmbedReport> {
        let started = Instant::now();

        // Writers first: embedding must observe a settled graph.
        if !self
            .locks
            .wait_for_unlock(INGESTION_LOCK, self.drain_timeout)
            .await
        {
            return Err(EmbeddingError::IngestionBusy(format!(
                "ingestion still locked after {:?}",
                self.drain_timeout
            )));
        }

        let _lock = self.locks.acquire(
            EMBEDDING_LOCK,
            format!("embed {} ({})", request.index.name, request.index.model),
        );

        let fields = request.source_fields();
        let targets = self
            .graph
            .select_embedding_targets(
                &request.index.node_label,
                &request.key_field,
                &fields,
                request.only_dirty,
            )
            .await?;

        if targets.is_empty() {
            debug!(index = %request.index.name, "Nothing to embed");
            return Ok(EmbedReport {
                duration_ms: elapsed_ms(started),
                ..EmbedReport::default()
            });
        }

        // Each work item is (node key, embedding property, text).
        let mut items: Vec<(String, String, String)> = Vec::new();
        for target in &targets {
            match &request.strategy {
                CombineStrategy::Concat => {
                    items.push((
                        target.key.clone(),
                        request.index.embedding_field(),
                        target.texts.join("\n\n"),
                    ));
                }
                CombineStrategy::Weighted(weights) => {
                    let mut parts = Vec::new();
                    for (i, text) in target.texts.iter().enumerate() {
                        let weight = weights.get(i).copied().unwrap_or(1.0);
                        let repeats = weight.round().max(1.0) as usize;
                        for _ in 0..repeats {
                            parts.push(text.clone());
                        }
                    }
                    items.push((
                        target.key.clone(),
                        request.index.embedding_field(),
                        parts.join("\n\n"),
                    ));
                }
                CombineStrategy::Separate => {
                    for (i, text) in target.texts.iter().enumerate() {
                        items.push((
                            target.key.clone(),
                            format!("{}_embedding", fields[i]),
                            text.clone(),
                        ));
                    }
                }
            }
        }

        let total = targets.len();
        let batches: Vec<Vec<(String, String, String)>> = items
            .chunks(request.batch_size.max(1))
            .map(<[_]>::to_vec)
            .collect();

        let results: Vec<std::result::Result<Vec<(String, String, Vec<f32>)>, (String, usize)>> =
            stream::iter(batches)
                .map(|batch| async move {
                    let texts: Vec<String> = batch.iter().map(|(_, _, t)| t.clone()).collect();
                    let vectors = self
                        .embed_with_retry(&texts)
                        .await
                        .map_err(|e| (e.to_string(), batch.len()))?;
                    Ok(batch
                        .into_iter()
                        .zip(vectors)
                        .map(|((key, field, _), vector)| (key, field, vector))
                        .collect())
                })
                .buffer_unordered(request.concurrency.max(1))
                .collect()
                .await;

        let mut report = EmbedReport {
            total,
            ..EmbedReport::default()
        };

        for result in results {
            match result {
                Ok(embedded) => {
                    let rows: Vec<Map<String, Value>> = embedded
                        .iter()
                        .map(|(key, field, vector)| {
                            let mut row = Map::new();
                            row.insert(request.key_field.clone(), json!(key));
                            row.insert(field.clone(), json!(vector));
                            row.insert("dirty".to_string(), json!(false));
                            row
                        })
                        .collect();
                    let count = rows.len();
                    match self
                        .graph
                        .upsert_nodes(&request.index.node_label, &request.key_field, rows)
                        .await
                    {
                        Ok(_) => report.succeeded += count,
                        Err(e) => {
                            warn!(error = %e, "Vector write-back failed; nodes stay dirty");
                            report.failed += count;
                        }
                    }
                }
                Err((message, count)) => {
                    warn!(error = %message, "Embedding batch failed after retries");
                    report.failed += count;
                }
            }
        }
        // Separate mode writes several vectors per node; clamp to totals.
        report.succeeded = report.succeeded.min(total);

        report.duration_ms = elapsed_ms(started);
        info!(
            index = %request.index.name,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Embedding run complete"
        );
        Ok(report)
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last = None;
        for (attempt, backoff) in BATCH_BACKOFFS.iter().enumerate() {
            match self.model.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    warn!(attempt, error = %e, "Provider batch failed");
                    last = Some(e);
                    if attempt + 1 < BATCH_BACKOFFS.len() {
                        tokio::time::sleep(*backoff).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| EmbeddingError::Provider("no attempts made".into())))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
