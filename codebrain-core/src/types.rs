//! Shared data-model types
//!
//! Graph node and delta shapes live in `codebrain-ingest`; conversation
//! shapes live in `codebrain-memory`. This module holds the types owned by
//! the daemon process itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Whether a project participates in watching and ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// Watched and ingested
    Active,
    /// Registered but skipped by watchers and ingestion
    Excluded,
}

/// A registered source root, unique by absolute path
///
/// Created on first ingestion of a path, destroyed only by explicit
/// unregister.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Stable identifier
    pub id: Uuid,
    /// Absolute path of the source root
    pub path: PathBuf,
    /// Display name, defaults to the directory name
    pub display_name: String,
    /// When the project was first registered
    pub created_at: DateTime<Utc>,
    /// Globs selecting files for ingestion
    pub include_globs: Vec<String>,
    /// Globs excluded from ingestion
    pub exclude_globs: Vec<String>,
    /// Current status
    pub status: ProjectStatus,
}

impl Project {
    /// Register a new active project at `path`
    #[must_use]
    pub fn new(path: PathBuf, include_globs: Vec<String>, exclude_globs: Vec<String>) -> Self {
        let display_name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into());
        Self {
            id: Uuid::new_v4(),
            path,
            display_name,
            created_at: Utc::now(),
            include_globs,
            exclude_globs,
            status: ProjectStatus::Active,
        }
    }
}

/// Kind of filesystem change, as reported by the watcher or over HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    /// Coalesce a newer change onto this one within a debounce window
    ///
    /// `created` then `updated` is still a create from the graph's point of
    /// view; any change followed by `deleted` is a delete.
    #[must_use]
    pub const fn coalesce(self, newer: Self) -> Self {
        match (self, newer) {
            (_, Self::Deleted) => Self::Deleted,
            (Self::Created, Self::Updated) => Self::Created,
            (_, newer) => newer,
        }
    }
}

/// A registered vector index over one node label
///
/// Registered at startup; used by retrieval and by the embedding pipeline
/// to choose provider and model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexDef {
    /// Index name in the database
    pub name: String,
    /// Label of the indexed nodes
    pub node_label: String,
    /// Property holding the text to embed
    pub source_field: String,
    /// Embedding dimension
    pub dimension: usize,
    /// Provider identifier (e.g. "openai")
    pub provider: String,
    /// Model identifier (e.g. "text-embedding-3-small")
    pub model: String,
}

impl VectorIndexDef {
    /// Property name the vectors are written back to
    #[must_use]
    pub fn embedding_field(&self) -> String {
        format!("{}_embedding", self.source_field)
    }
}

/// An agent persona; exactly one may be active at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Unique identifier
    pub id: String,
    /// Display name, unique among personas
    pub name: String,
    /// Accent color for UIs
    pub color: String,
    /// Preferred response language
    pub language: String,
    /// Prompt text injected as a labeled input field
    pub persona: String,
    /// Short description
    pub description: String,
    /// Whether this persona is the fallback when none is selected
    pub is_default: bool,
}
