//! In-memory `GraphStore` for tests
//!
//! Implements the same idempotence contract as the Neo4j adapter over
//! plain hash maps, plus a brute-force cosine search over stored
//! embeddings. The opaque Cypher pass-through is unsupported here.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::store::GraphStore;
use crate::types::{
    ConstraintDef, EdgeRow, EmbeddingTarget, IndexDef, KeySpec, QueryResult, UpsertStats,
    VectorHit, VectorSearchOptions,
};
use codebrain_core::VectorIndexDef;

type NodeKey = (String, String);
type EdgeKey = (String, String, String);

#[derive(Default)]
struct State {
    nodes: HashMap<NodeKey, Map<String, Value>>,
    edges: HashMap<EdgeKey, Map<String, Value>>,
    vector_indexes: Vec<VectorIndexDef>,
}

/// Hash-map backed graph store
#[derive(Default)]
pub struct MemoryGraphStore {
    state: RwLock<State>,
}

impl MemoryGraphStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes with the given label
    #[must_use]
    pub fn node_count(&self, label: &str) -> usize {
        self.state
            .read()
            .nodes
            .keys()
            .filter(|(l, _)| l == label)
            .count()
    }

    /// Number of stored edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }

    /// Fetch one node's properties
    #[must_use]
    pub fn get_node(&self, label: &str, key: &str) -> Option<Map<String, Value>> {
        self.state
            .read()
            .nodes
            .get(&(label.to_string(), key.to_string()))
            .cloned()
    }

    fn key_string(row: &Map<String, Value>, key_field: &str) -> Option<String> {
        row.get(key_field).map(value_to_key)
    }
}

fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for i in 0..a.len().min(b.len()) {
        dot += a[i] * b[i];
        na += a[i] * a[i];
        nb += b[i] * b[i];
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn run(&self, _query: &str, _params: Value) -> Result<QueryResult> {
        Err(GraphError::Unsupported(
            "cypher pass-through requires the Neo4j backend".to_string(),
        ))
    }

    async fn upsert_nodes(
        &self,
        label: &str,
        key_field: &str,
        rows: Vec<Map<String, Value>>,
    ) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        let mut state = self.state.write();

        for row in rows {
            let Some(key) = Self::key_string(&row, key_field) else {
                return Err(GraphError::InvalidInput(format!(
                    "row missing key field `{key_field}`"
                )));
            };
            match state.nodes.entry((label.to_string(), key)) {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    slot.get_mut().extend(row);
                    stats.updated += 1;
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(row);
                    stats.created += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn upsert_edges(
        &self,
        edge_type: &str,
        from: &KeySpec,
        to: &KeySpec,
        rows: Vec<EdgeRow>,
    ) -> Result<usize> {
        let mut state = self.state.write();
        let mut processed = 0;

        for row in rows {
            let from_key = (from.label.clone(), value_to_key(&row.from));
            let to_key = (to.label.clone(), value_to_key(&row.to));
            // Match Neo4j MATCH semantics: missing endpoints skip the edge.
            if !state.nodes.contains_key(&from_key) || !state.nodes.contains_key(&to_key) {
                continue;
            }
            state.edges.insert(
                (edge_type.to_string(), from_key.1, to_key.1),
                row.properties,
            );
            processed += 1;
        }
        Ok(processed)
    }

    async fn delete_by_key(
        &self,
        label: &str,
        key_field: &str,
        value: &Value,
        cascade: bool,
    ) -> Result<usize> {
        let key = value_to_key(value);
        let mut state = self.state.write();
        let mut deleted = 0;

        if state.nodes.remove(&(label.to_string(), key.clone())).is_some() {
            deleted += 1;
        }

        if cascade {
            // Children reference their parent by a `parent` property.
            let doomed: Vec<NodeKey> = state
                .nodes
                .iter()
                .filter(|(_, props)| {
                    props.get("parent").map(value_to_key).as_deref() == Some(key.as_str())
                })
                .map(|(k, _)| k.clone())
                .collect();
            for k in doomed {
                state.nodes.remove(&k);
                deleted += 1;
            }
        }

        state
            .edges
            .retain(|(_, f, t), _| f != &key && t != &key);
        let _ = key_field;
        Ok(deleted)
    }

    async fn mark_dirty(&self, label: &str, key_field: &str, values: &[Value]) -> Result<usize> {
        let mut state = self.state.write();
        let mut marked = 0;
        for value in values {
            let key = (label.to_string(), value_to_key(value));
            if let Some(props) = state.nodes.get_mut(&key) {
                props.insert("dirty".to_string(), Value::Bool(true));
                marked += 1;
            }
        }
        let _ = key_field;
        Ok(marked)
    }

    async fn find_nodes(
        &self,
        label: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<Vec<Value>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .iter()
            .filter(|((l, _), _)| l == label)
            .filter(|(_, props)| match filter {
                Some((field, value)) => props.get(field) == Some(value),
                None => true,
            })
            .map(|(_, props)| Value::Object(props.clone()))
            .collect())
    }

    async fn select_embedding_targets(
        &self,
        label: &str,
        key_field: &str,
        source_fields: &[String],
        only_dirty: bool,
    ) -> Result<Vec<EmbeddingTarget>> {
        let state = self.state.read();
        let mut targets = Vec::new();

        for ((l, _), props) in &state.nodes {
            if l != label {
                continue;
            }
            if only_dirty && props.get("dirty") != Some(&Value::Bool(true)) {
                continue;
            }
            let Some(key) = props.get(key_field).map(value_to_key) else {
                continue;
            };
            let texts = source_fields
                .iter()
                .map(|f| {
                    props
                        .get(f)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                })
                .collect();
            targets.push(EmbeddingTarget { key, texts });
        }
        Ok(targets)
    }

    async fn vector_search(
        &self,
        index_name: &str,
        query_embedding: &[f32],
        top_k: usize,
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorHit>> {
        let state = self.state.read();
        let index = state
            .vector_indexes
            .iter()
            .find(|v| v.name == index_name)
            .ok_or_else(|| GraphError::InvalidInput(format!("unknown vector index {index_name}")))?
            .clone();

        let embedding_field = index.embedding_field();
        let mut hits: Vec<VectorHit> = state
            .nodes
            .iter()
            .filter(|((l, _), _)| l == &index.node_label)
            .filter_map(|((_, key), props)| {
                let stored: Vec<f32> = props
                    .get(&embedding_field)?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect();
                let score = cosine(query_embedding, &stored);
                if score < options.min_score {
                    return None;
                }
                if let Some(uuids) = &options.filter_uuids {
                    if !uuids.contains(key) {
                        return None;
                    }
                }
                Some(VectorHit {
                    node_id: key.clone(),
                    score,
                    properties: Value::Object(props.clone()),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn ensure_schema(
        &self,
        _constraints: &[ConstraintDef],
        _indexes: &[IndexDef],
        vector_indexes: &[VectorIndexDef],
    ) -> Result<()> {
        let mut state = self.state.write();
        for def in vector_indexes {
            if !state.vector_indexes.iter().any(|v| v.name == def.name) {
                state.vector_indexes.push(def.clone());
            }
        }
        Ok(())
    }
}
