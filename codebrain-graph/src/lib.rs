//! Graph storage adapter
//!
//! The daemon owns exactly one labeled-property graph with vector indexes.
//! `GraphStore` is the seam: ingestion, embedding, memory, and tools all
//! talk to the trait; the Neo4j adapter is the production implementation
//! and `MemoryGraphStore` backs tests.

pub mod error;
pub mod memory;
pub mod neo4j;
pub mod schema;
pub mod store;
pub mod types;

pub use error::{GraphError, Result};
pub use memory::MemoryGraphStore;
pub use neo4j::Neo4jStore;
pub use store::GraphStore;
pub use types::{
    ConstraintDef, EdgeRow, EmbeddingTarget, IndexDef, KeySpec, QueryCounters, QueryResult,
    UpsertStats, VectorHit, VectorSearchOptions,
};
