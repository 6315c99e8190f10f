//! Wire types for the graph adapter

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies nodes of one label by one key property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Node label
    pub label: String,
    /// Property identifying nodes of this label
    pub key_field: String,
}

impl KeySpec {
    /// Convenience constructor
    #[must_use]
    pub fn new(label: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key_field: key_field.into(),
        }
    }
}

/// One edge to upsert between two keyed nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRow {
    /// Key value of the source node
    pub from: Value,
    /// Key value of the target node
    pub to: Value,
    /// Edge properties
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Write counters reported with a query result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCounters {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub properties_set: u64,
    /// Rows returned by the query
    pub records_returned: u64,
}

/// Result of an opaque query pass-through
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// One JSON object per returned row
    pub records: Vec<Value>,
    /// Write counters, where the backend exposes them
    pub counters: QueryCounters,
}

/// Outcome of an idempotent node upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertStats {
    /// Nodes that did not exist before
    pub created: usize,
    /// Nodes that existed and were updated
    pub updated: usize,
}

impl UpsertStats {
    /// Merge another batch's stats into this one
    pub fn absorb(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
    }
}

/// One vector-search hit, in descending score order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    /// Key value (uuid) of the matched node
    pub node_id: String,
    /// Similarity score in `[0, 1]`
    pub score: f32,
    /// Node properties
    pub properties: Value,
}

/// Optional constraints on a vector search
#[derive(Debug, Clone, Default)]
pub struct VectorSearchOptions {
    /// Drop hits scoring below this
    pub min_score: f32,
    /// Restrict hits to these node uuids
    pub filter_uuids: Option<Vec<String>>,
    /// Extra Cypher predicate over `node`, ANDed in
    pub extra_where: Option<String>,
}

impl VectorSearchOptions {
    /// Whether any post-search filter is active
    #[must_use]
    pub fn has_filters(&self) -> bool {
        self.filter_uuids.is_some() || self.extra_where.is_some()
    }
}

/// A node selected for embedding: key plus the text of its source fields
#[derive(Debug, Clone)]
pub struct EmbeddingTarget {
    /// Key value (uuid or path) of the node
    pub key: String,
    /// Source-field texts, in declaration order
    pub texts: Vec<String>,
}

/// A uniqueness constraint to ensure at startup
#[derive(Debug, Clone)]
pub struct ConstraintDef {
    pub name: String,
    pub label: String,
    pub property: String,
}

/// A plain index to ensure at startup
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub label: String,
    pub property: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_stats_absorb() {
        let mut total = UpsertStats::default();
        total.absorb(UpsertStats {
            created: 3,
            updated: 1,
        });
        total.absorb(UpsertStats {
            created: 0,
            updated: 5,
        });
        assert_eq!(total.created, 3);
        assert_eq!(total.updated, 6);
    }

    #[test]
    fn test_vector_options_filter_detection() {
        assert!(!VectorSearchOptions::default().has_filters());
        let opts = VectorSearchOptions {
            filter_uuids: Some(vec!["a".into()]),
            ..Default::default()
        };
        assert!(opts.has_filters());
    }
}
