//! Error types for conversation memory

use codebrain_core::CoreError;
use codebrain_graph::GraphError;
use thiserror::Error;

/// Result type alias for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors raised by the conversation store and summarizer
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Unknown conversation or message id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input (bad export payload, invalid role)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The summarization LLM failed
    #[error("Summarizer error: {0}")]
    Summarizer(String),

    /// The graph backend failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<MemoryError> for CoreError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::NotFound(m) | MemoryError::InvalidInput(m) => Self::InvalidInput(m),
            MemoryError::Summarizer(m) => Self::UpstreamUnavailable(m),
            MemoryError::Graph(g) => g.into(),
            MemoryError::Serialization(e) => Self::InvalidInput(e.to_string()),
        }
    }
}
