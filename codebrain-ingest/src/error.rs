//! Error types for parsing, ingestion, and watching

use codebrain_core::CoreError;
use codebrain_graph::GraphError;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors raised along the watch → parse → ingest pipeline
#[derive(Debug, Error)]
pub enum IngestError {
    /// A source file could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Include or exclude globs were malformed
    #[error("Invalid glob: {0}")]
    Glob(String),

    /// Filesystem access failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The graph backend rejected or lost a batch
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The OS watcher could not be created or registered
    #[error("Watcher error: {0}")]
    Watch(String),

    /// A batch kept failing after all retries
    #[error("Batch failed after {attempts} attempts: {message}")]
    BatchExhausted { attempts: usize, message: String },
}

impl From<notify::Error> for IngestError {
    fn from(e: notify::Error) -> Self {
        Self::Watch(e.to_string())
    }
}

impl From<IngestError> for CoreError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Parse(m) | IngestError::Glob(m) => Self::InvalidInput(m),
            IngestError::Io(e) => e.into(),
            IngestError::Graph(g) => g.into(),
            IngestError::Watch(m) => Self::Fatal(m),
            IngestError::BatchExhausted { message, .. } => Self::UpstreamUnavailable(message),
        }
    }
}
