//! Error types for context assembly

use codebrain_core::CoreError;
use thiserror::Error;

/// Result type alias for context operations
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors raised while assembling context
#[derive(Debug, Error)]
pub enum ContextError {
    /// Conversation lookup failed
    #[error(transparent)]
    Memory(#[from] codebrain_memory::MemoryError),

    /// Retrieval against the graph failed
    #[error(transparent)]
    Graph(#[from] codebrain_graph::GraphError),

    /// Query embedding failed
    #[error(transparent)]
    Embedding(#[from] codebrain_embeddings::EmbeddingError),
}

impl From<ContextError> for CoreError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Memory(m) => m.into(),
            ContextError::Graph(g) => g.into(),
            ContextError::Embedding(m) => m.into(),
        }
    }
}
