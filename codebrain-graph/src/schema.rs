//! Built-in schema for the code knowledge graph
//!
//! The daemon calls `ensure_schema` with these on every start; everything
//! is `IF NOT EXISTS` so repeated starts are no-ops.

use crate::types::{ConstraintDef, IndexDef};
use codebrain_core::VectorIndexDef;

/// Uniqueness constraints for the core labels
#[must_use]
pub fn core_constraints() -> Vec<ConstraintDef> {
    [
        ("file_path_unique", "File", "path"),
        ("dir_path_unique", "Directory", "path"),
        ("scope_uuid_unique", "Scope", "uuid"),
        ("project_path_unique", "Project", "path"),
        ("library_name_unique", "ExternalLibrary", "name"),
        ("conversation_uuid_unique", "Conversation", "uuid"),
        ("message_uuid_unique", "Message", "uuid"),
        ("summary_uuid_unique", "Summary", "uuid"),
    ]
    .iter()
    .map(|(name, label, property)| ConstraintDef {
        name: (*name).to_string(),
        label: (*label).to_string(),
        property: (*property).to_string(),
    })
    .collect()
}

/// Plain lookup indexes
#[must_use]
pub fn core_indexes() -> Vec<IndexDef> {
    [
        ("scope_dirty", "Scope", "dirty"),
        ("file_dirty", "File", "dirty"),
        ("message_conversation", "Message", "conversation_id"),
        ("summary_conversation", "Summary", "conversation_id"),
    ]
    .iter()
    .map(|(name, label, property)| IndexDef {
        name: (*name).to_string(),
        label: (*label).to_string(),
        property: (*property).to_string(),
    })
    .collect()
}

/// Vector index over conversation summaries, used by context retrieval
#[must_use]
pub fn summary_vector_index(dimension: usize, provider: &str, model: &str) -> VectorIndexDef {
    VectorIndexDef {
        name: "summary_embedding_index".to_string(),
        node_label: "Summary".to_string(),
        source_field: "combined".to_string(),
        dimension,
        provider: provider.to_string(),
        model: model.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_schema_covers_keyed_labels() {
        let constraints = core_constraints();
        for label in ["File", "Directory", "Scope", "Project", "Conversation"] {
            assert!(
                constraints.iter().any(|c| c.label == label),
                "missing constraint for {label}"
            );
        }
    }

    #[test]
    fn test_summary_index_field() {
        let index = summary_vector_index(1536, "openai", "text-embedding-3-small");
        assert_eq!(index.embedding_field(), "combined_embedding");
    }
}
