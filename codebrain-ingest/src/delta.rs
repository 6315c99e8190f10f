//! Graph delta types emitted by parsers
//!
//! Node keys embed their label namespace via prefix (`file:`, `dir:`,
//! `scope:`, `lib:`, `project:`), so a delta is self-describing: the
//! ingestor can route every node and edge to the right label and key
//! field without consulting the parser again.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Namespaced key constructors
pub mod keys {
    /// Key for a source file, by project-relative path
    #[must_use]
    pub fn file(path: &str) -> String {
        format!("file:{path}")
    }

    /// Key for a directory, by project-relative path
    #[must_use]
    pub fn dir(path: &str) -> String {
        format!("dir:{path}")
    }

    /// Key for a scope, by stable scope id
    #[must_use]
    pub fn scope(uuid: &str) -> String {
        format!("scope:{uuid}")
    }

    /// Key for an external library, by name
    #[must_use]
    pub fn lib(name: &str) -> String {
        format!("lib:{name}")
    }

    /// Key for a project, by root path
    #[must_use]
    pub fn project(path: &str) -> String {
        format!("project:{path}")
    }

    /// Split a namespaced key into `(prefix, value)`
    #[must_use]
    pub fn split(key: &str) -> Option<(&str, &str)> {
        key.split_once(':')
    }
}

/// One node in a delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Namespaced key (`file:src/a.rs`, `scope:src/a.rs::main`, …)
    pub key: String,
    /// Node label
    pub label: String,
    /// Properties to merge; must include the label's key field
    pub properties: Map<String, Value>,
}

/// One edge in a delta, endpoints referenced by namespaced keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Edge type (`CONTAINS_FILE`, `CONTAINS_SCOPE`, `IMPORTS`, …)
    pub edge_type: String,
    /// Namespaced key of the source node
    pub from: String,
    /// Namespaced key of the target node
    pub to: String,
    /// Edge properties
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Counters accumulated during a parse
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ParseStats {
    pub directories: usize,
    pub scopes: usize,
    pub libraries: usize,
    pub skipped: usize,
}

/// Everything a parser produced for one batch of files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDelta {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    pub files_processed: usize,
    pub stats: ParseStats,
}

impl GraphDelta {
    /// Whether the delta carries any work
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces() {
        assert_eq!(keys::file("src/a.rs"), "file:src/a.rs");
        assert_eq!(keys::scope("src/a.rs::main"), "scope:src/a.rs::main");
        assert_eq!(
            keys::split("file:src/a.rs"),
            Some(("file", "src/a.rs"))
        );
        // Scope ids contain colons; split must stop at the first one.
        assert_eq!(
            keys::split("scope:src/a.rs::main"),
            Some(("scope", "src/a.rs::main"))
        );
    }

    #[test]
    fn test_empty_delta() {
        assert!(GraphDelta::default().is_empty());
    }
}
