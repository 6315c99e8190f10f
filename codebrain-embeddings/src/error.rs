//! Error types for embedding generation

use codebrain_core::CoreError;
use codebrain_graph::GraphError;
use thiserror::Error;

/// Result type alias for embedding operations
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors raised by providers and the pipeline
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Provider misconfiguration (missing API key, bad model name)
    #[error("Embedding configuration error: {0}")]
    Config(String),

    /// The provider API failed or returned garbage
    #[error("Embedding provider error: {0}")]
    Provider(String),

    /// The ingestion lock did not drain before the run
    #[error("Timed out waiting for ingestion to drain: {0}")]
    IngestionBusy(String),

    /// The graph rejected the vector write-back
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        Self::Provider(e.to_string())
    }
}

impl From<EmbeddingError> for CoreError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::Config(m) => Self::InvalidInput(m),
            EmbeddingError::Provider(m) => Self::UpstreamUnavailable(m),
            EmbeddingError::IngestionBusy(m) => Self::Timeout(m),
            EmbeddingError::Graph(g) => g.into(),
        }
    }
}
