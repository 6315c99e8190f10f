//! Core types and primitives shared by every codebrain crate.
//!
//! This crate deliberately stays at the bottom of the dependency graph: it
//! holds the error taxonomy, the named lock registry that serializes
//! ingestion against embedding and reads, the shared data-model types
//! (projects, personas, vector index definitions), and the argument
//! sanitization helpers used when recording tool calls.

pub mod error;
pub mod locks;
pub mod sanitize;
pub mod types;

pub use error::{CoreError, Result};
pub use locks::{LockHandle, LockRegistry, LockStatus, EMBEDDING_LOCK, INGESTION_LOCK};
pub use types::{ChangeType, Persona, Project, ProjectStatus, VectorIndexDef};
