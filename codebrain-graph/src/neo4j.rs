//! Neo4j implementation of `GraphStore`
//!
//! Queries are built per operation with parameterized batches (`UNWIND`),
//! so every write is one round trip per batch regardless of row count.
//! All DDL uses `IF NOT EXISTS`, keeping `ensure_schema` idempotent.

use async_trait::async_trait;
use neo4rs::{query, BoltList, BoltMap, BoltNull, BoltType, Graph};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{GraphError, Result};
use crate::store::{overfetch_count, GraphStore};
use crate::types::{
    ConstraintDef, EdgeRow, EmbeddingTarget, IndexDef, KeySpec, QueryCounters, QueryResult,
    UpsertStats, VectorHit, VectorSearchOptions,
};
use codebrain_core::VectorIndexDef;

/// Neo4j-backed graph store
pub struct Neo4jStore {
    graph: Graph,
    database: String,
}

impl Neo4jStore {
    /// Connect to a Neo4j instance
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Connection` if the bolt handshake or
    /// authentication fails.
    pub async fn connect(
        uri: &str,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self> {
        let graph = Graph::new(uri, username, password)
            .await
            .map_err(|e| GraphError::Connection(format!("connect to {uri}: {e}")))?;
        info!(uri, database, "Connected to Neo4j");
        Ok(Self {
            graph,
            database: database.to_string(),
        })
    }

    /// Database name this store is bound to
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    async fn execute_collect(&self, q: neo4rs::Query) -> Result<Vec<Value>> {
        let mut stream = self.graph.execute(q).await?;
        let mut records = Vec::new();
        while let Some(row) = stream.next().await? {
            let record = row
                .to::<Value>()
                .map_err(|e| GraphError::Query(format!("row decode: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Convert a JSON value into a bolt parameter
fn json_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull {}),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => n
            .as_i64()
            .map_or_else(|| n.as_f64().unwrap_or(0.0).into(), Into::into),
        Value::String(s) => s.clone().into(),
        Value::Array(items) => BoltType::List(BoltList {
            value: items.iter().map(json_to_bolt).collect::<Vec<BoltType>>(),
        }),
        Value::Object(fields) => BoltType::Map(
            fields
                .iter()
                .map(|(k, v)| (k.clone().into(), json_to_bolt(v)))
                .collect::<BoltMap>(),
        ),
    }
}

fn rows_to_bolt(rows: &[Map<String, Value>]) -> BoltType {
    BoltType::List(BoltList {
        value: rows
            .iter()
            .map(|r| json_to_bolt(&Value::Object(r.clone())))
            .collect::<Vec<BoltType>>(),
    })
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn run(&self, cypher: &str, params: Value) -> Result<QueryResult> {
        let mut q = query(cypher);
        if let Value::Object(fields) = &params {
            for (key, value) in fields {
                q = q.param(key, json_to_bolt(value));
            }
        } else if !params.is_null() {
            return Err(GraphError::InvalidInput(
                "query params must be a JSON object".to_string(),
            ));
        }

        let records = self.execute_collect(q).await?;
        let counters = QueryCounters {
            records_returned: records.len() as u64,
            ..QueryCounters::default()
        };
        Ok(QueryResult { records, counters })
    }

    async fn upsert_nodes(
        &self,
        label: &str,
        key_field: &str,
        rows: Vec<Map<String, Value>>,
    ) -> Result<UpsertStats> {
        if rows.is_empty() {
            return Ok(UpsertStats::default());
        }

        // The transient `_merge_created` property distinguishes ON CREATE
        // from ON MATCH inside one UNWIND pass.
        let cypher = format!(
            "UNWIND $rows AS row \
             MERGE (n:`{label}` {{`{key_field}`: row.`{key_field}`}}) \
             ON CREATE SET n += row, n.`_merge_created` = true \
             ON MATCH SET n += row, n.`_merge_created` = false \
             WITH n, n.`_merge_created` AS was_created \
             REMOVE n.`_merge_created` \
             RETURN sum(CASE WHEN was_created THEN 1 ELSE 0 END) AS created, \
                    sum(CASE WHEN was_created THEN 0 ELSE 1 END) AS updated"
        );

        let records = self
            .execute_collect(query(&cypher).param("rows", rows_to_bolt(&rows)))
            .await?;

        let stats = records.first().map_or_else(UpsertStats::default, |r| {
            UpsertStats {
                created: r["created"].as_u64().unwrap_or(0) as usize,
                updated: r["updated"].as_u64().unwrap_or(0) as usize,
            }
        });
        debug!(label, created = stats.created, updated = stats.updated, "Upserted nodes");
        Ok(stats)
    }

    async fn upsert_edges(
        &self,
        edge_type: &str,
        from: &KeySpec,
        to: &KeySpec,
        rows: Vec<EdgeRow>,
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let cypher = format!(
            "UNWIND $rows AS row \
             MATCH (a:`{}` {{`{}`: row.from}}) \
             MATCH (b:`{}` {{`{}`: row.to}}) \
             MERGE (a)-[r:`{edge_type}`]->(b) \
             SET r += row.properties \
             RETURN count(r) AS upserted",
            from.label, from.key_field, to.label, to.key_field
        );

        let bolt_rows: Vec<Map<String, Value>> = rows
            .into_iter()
            .map(|r| {
                let mut m = Map::new();
                m.insert("from".to_string(), r.from);
                m.insert("to".to_string(), r.to);
                m.insert("properties".to_string(), Value::Object(r.properties));
                m
            })
            .collect();

        let records = self
            .execute_collect(query(&cypher).param("rows", rows_to_bolt(&bolt_rows)))
            .await?;
        Ok(records
            .first()
            .and_then(|r| r["upserted"].as_u64())
            .unwrap_or(0) as usize)
    }

    async fn delete_by_key(
        &self,
        label: &str,
        key_field: &str,
        value: &Value,
        cascade: bool,
    ) -> Result<usize> {
        let cypher = if cascade {
            // Scopes hang off files; deleting the file removes them too.
            format!(
                "MATCH (n:`{label}` {{`{key_field}`: $value}}) \
                 OPTIONAL MATCH (n)-[:CONTAINS_SCOPE|HAS_CHILD*1..]->(child) \
                 WITH collect(DISTINCT n) + collect(DISTINCT child) AS doomed \
                 UNWIND doomed AS d \
                 DETACH DELETE d \
                 RETURN count(d) AS deleted"
            )
        } else {
            format!(
                "MATCH (n:`{label}` {{`{key_field}`: $value}}) \
                 DETACH DELETE n \
                 RETURN count(n) AS deleted"
            )
        };

        let records = self
            .execute_collect(query(&cypher).param("value", json_to_bolt(value)))
            .await?;
        Ok(records
            .first()
            .and_then(|r| r["deleted"].as_u64())
            .unwrap_or(0) as usize)
    }

    async fn mark_dirty(&self, label: &str, key_field: &str, values: &[Value]) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }
        let cypher = format!(
            "MATCH (n:`{label}`) WHERE n.`{key_field}` IN $values \
             SET n.dirty = true \
             RETURN count(n) AS marked"
        );
        let records = self
            .execute_collect(
                query(&cypher).param("values", json_to_bolt(&Value::Array(values.to_vec()))),
            )
            .await?;
        Ok(records
            .first()
            .and_then(|r| r["marked"].as_u64())
            .unwrap_or(0) as usize)
    }

    async fn find_nodes(
        &self,
        label: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<Vec<Value>> {
        let (clause, param) = match filter {
            Some((field, value)) => (
                format!("WHERE n.`{field}` = $value"),
                Some(json_to_bolt(value)),
            ),
            None => (String::new(), None),
        };
        let cypher = format!("MATCH (n:`{label}`) {clause} RETURN properties(n) AS props");
        let mut q = query(&cypher);
        if let Some(p) = param {
            q = q.param("value", p);
        }
        let records = self.execute_collect(q).await?;
        Ok(records.into_iter().map(|r| r["props"].clone()).collect())
    }

    async fn select_embedding_targets(
        &self,
        label: &str,
        key_field: &str,
        source_fields: &[String],
        only_dirty: bool,
    ) -> Result<Vec<EmbeddingTarget>> {
        let fields: Vec<String> = source_fields
            .iter()
            .map(|f| format!("coalesce(n.`{f}`, '') AS `{f}`"))
            .collect();
        let dirty_clause = if only_dirty { "WHERE n.dirty = true" } else { "" };
        let cypher = format!(
            "MATCH (n:`{label}`) {dirty_clause} \
             RETURN n.`{key_field}` AS key, {}",
            fields.join(", ")
        );

        let records = self.execute_collect(query(&cypher)).await?;
        let mut targets = Vec::with_capacity(records.len());
        for record in records {
            let Some(key) = record["key"].as_str() else {
                warn!(label, "Skipping embedding target without key");
                continue;
            };
            let texts = source_fields
                .iter()
                .map(|f| record[f].as_str().unwrap_or_default().to_string())
                .collect();
            targets.push(EmbeddingTarget {
                key: key.to_string(),
                texts,
            });
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
        // Filters shrink the candidate set after the index lookup, so ask
        // the index for more than top_k up front.
        let fetch_k = if options.has_filters() {
            overfetch_count(top_k)
        } else {
            top_k
        };

        let mut predicates = vec!["score >= $min_score".to_string()];
        if options.filter_uuids.is_some() {
            predicates.push("node.uuid IN $uuids".to_string());
        }
        if let Some(extra) = &options.extra_where {
            predicates.push(format!("({extra})"));
        }

        let cypher = format!(
            "CALL db.index.vector.queryNodes($index, $k, $embedding) \
             YIELD node, score \
             WHERE {} \
             RETURN node.uuid AS node_id, score, properties(node) AS props \
             ORDER BY score DESC \
             LIMIT $top_k",
            predicates.join(" AND ")
        );

        let mut q = query(&cypher)
            .param("index", index_name)
            .param("k", fetch_k as i64)
            .param("embedding", query_embedding.to_vec())
            .param("min_score", f64::from(options.min_score))
            .param("top_k", top_k as i64);
        if let Some(uuids) = &options.filter_uuids {
            q = q.param(
                "uuids",
                json_to_bolt(&Value::Array(
                    uuids.iter().map(|u| Value::String(u.clone())).collect(),
                )),
            );
        }

        let records = self.execute_collect(q).await?;
        let hits = records
            .into_iter()
            .filter_map(|r| {
                Some(VectorHit {
                    node_id: r["node_id"].as_str()?.to_string(),
                    score: r["score"].as_f64()? as f32,
                    properties: r["props"].clone(),
                })
            })
            .collect();
        Ok(hits)
    }

    async fn ensure_schema(
        &self,
        constraints: &[ConstraintDef],
        indexes: &[IndexDef],
        vector_indexes: &[VectorIndexDef],
    ) -> Result<()> {
        for c in constraints {
            let ddl = format!(
                "CREATE CONSTRAINT `{}` IF NOT EXISTS \
                 FOR (n:`{}`) REQUIRE n.`{}` IS UNIQUE",
                c.name, c.label, c.property
            );
            self.graph
                .run(query(&ddl))
                .await
                .map_err(|e| GraphError::Schema(format!("constraint {}: {e}", c.name)))?;
        }

        for i in indexes {
            let ddl = format!(
                "CREATE INDEX `{}` IF NOT EXISTS FOR (n:`{}`) ON (n.`{}`)",
                i.name, i.label, i.property
            );
            self.graph
                .run(query(&ddl))
                .await
                .map_err(|e| GraphError::Schema(format!("index {}: {e}", i.name)))?;
        }

        for v in vector_indexes {
            let ddl = format!(
                "CREATE VECTOR INDEX `{}` IF NOT EXISTS \
                 FOR (n:`{}`) ON (n.`{}`) \
                 OPTIONS {{indexConfig: {{\
                 `vector.dimensions`: {}, \
                 `vector.similarity_function`: 'cosine'}}}}",
                v.name,
                v.node_label,
                v.embedding_field(),
                v.dimension
            );
            self.graph
                .run(query(&ddl))
                .await
                .map_err(|e| GraphError::Schema(format!("vector index {}: {e}", v.name)))?;
        }

        info!(
            constraints = constraints.len(),
            indexes = indexes.len(),
            vector_indexes = vector_indexes.len(),
            "Schema ensured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_to_bolt_scalars() {
        assert!(matches!(json_to_bolt(&Value::Null), BoltType::Null(_)));
        assert!(matches!(json_to_bolt(&Value::Bool(true)), BoltType::Boolean(_)));
        assert!(matches!(
            json_to_bolt(&serde_json::json!(42)),
            BoltType::Integer(_)
        ));
        assert!(matches!(
            json_to_bolt(&serde_json::json!(1.5)),
            BoltType::Float(_)
        ));
        assert!(matches!(
            json_to_bolt(&serde_json::json!("hi")),
            BoltType::String(_)
        ));
    }

    #[test]
    fn test_json_to_bolt_containers() {
        assert!(matches!(
            json_to_bolt(&serde_json::json!([1, 2])),
            BoltType::List(_)
        ));
        assert!(matches!(
            json_to_bolt(&serde_json::json!({"a": 1})),
            BoltType::Map(_)
        ));
    }
}
