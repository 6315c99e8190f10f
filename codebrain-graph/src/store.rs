//! The graph storage trait

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{
    ConstraintDef, EdgeRow, EmbeddingTarget, IndexDef, KeySpec, QueryResult, UpsertStats,
    VectorHit, VectorSearchOptions,
};
use codebrain_core::VectorIndexDef;

/// Adapter over an external labeled-property graph with vector indexes
///
/// All mutating operations are idempotent under their natural identity:
/// nodes by `(label, key_field)`, edges by `(type, from, to)`. Callers
/// rely on this for retry safety; an implementation that creates
/// duplicates on replay is broken.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Opaque query pass-through for tools
    async fn run(&self, query: &str, params: Value) -> Result<QueryResult>;

    /// MERGE-style create-or-update of nodes
    ///
    /// Each row must contain `key_field`. Properties not present in a row
    /// are preserved on existing nodes.
    async fn upsert_nodes(
        &self,
        label: &str,
        key_field: &str,
        rows: Vec<Map<String, Value>>,
    ) -> Result<UpsertStats>;

    /// Idempotent edge upsert between keyed nodes
    ///
    /// Returns the number of edges processed. Edges whose endpoints do not
    /// exist are skipped, not created.
    async fn upsert_edges(
        &self,
        edge_type: &str,
        from: &KeySpec,
        to: &KeySpec,
        rows: Vec<EdgeRow>,
    ) -> Result<usize>;

    /// Delete a node by key, optionally cascading to attached scopes and
    /// children. Returns the number of nodes deleted.
    async fn delete_by_key(
        &self,
        label: &str,
        key_field: &str,
        value: &Value,
        cascade: bool,
    ) -> Result<usize>;

    /// Set `dirty = true` on the named nodes for later embedding
    async fn mark_dirty(&self, label: &str, key_field: &str, values: &[Value]) -> Result<usize>;

    /// Read nodes of one label, optionally filtered by an exact property
    /// match. Returns each node's properties as a JSON object, in no
    /// particular order.
    async fn find_nodes(
        &self,
        label: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<Vec<Value>>;

    /// Select embedding targets for one label
    ///
    /// With `only_dirty`, restricts to nodes whose `dirty` flag is set.
    /// Returns the node key plus the text of each requested source field
    /// (missing fields yield empty strings).
    async fn select_embedding_targets(
        &self,
        label: &str,
        key_field: &str,
        source_fields: &[String],
        only_dirty: bool,
    ) -> Result<Vec<EmbeddingTarget>>;

    /// Similarity search over a registered vector index
    ///
    /// When `options` carries filters, the backend must over-fetch at
    /// least `max(3 × top_k, 100)` candidates before trimming so that
    /// post-filter shrinkage cannot drop below `top_k`. Results come back
    /// in descending score order.
    async fn vector_search(
        &self,
        index_name: &str,
        query_embedding: &[f32],
        top_k: usize,
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorHit>>;

    /// Idempotently ensure constraints, indexes, and vector indexes
    ///
    /// Safe to call on every start.
    async fn ensure_schema(
        &self,
        constraints: &[ConstraintDef],
        indexes: &[IndexDef],
        vector_indexes: &[VectorIndexDef],
    ) -> Result<()>;
}

/// Candidate count a filtered vector search must request before trimming
#[must_use]
pub fn overfetch_count(top_k: usize) -> usize {
    (top_k * 3).max(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overfetch_floor() {
        assert_eq!(overfetch_count(5), 100);
        assert_eq!(overfetch_count(33), 100);
        assert_eq!(overfetch_count(50), 150);
    }
}
