//! Error types for graph operations

use codebrain_core::CoreError;
use thiserror::Error;

/// Result type alias for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors that can occur against the graph backend
#[derive(Debug, Error)]
pub enum GraphError {
    /// Could not reach or authenticate with the database
    #[error("Graph connection error: {0}")]
    Connection(String),

    /// A query failed at the database
    #[error("Graph query error: {0}")]
    Query(String),

    /// Schema DDL was rejected by the database
    #[error("Graph schema error: {0}")]
    Schema(String),

    /// Caller passed something the adapter cannot express
    #[error("Invalid graph input: {0}")]
    InvalidInput(String),

    /// Operation not supported by this backend
    #[error("Unsupported graph operation: {0}")]
    Unsupported(String),

    /// Serialization of properties failed
    #[error("Graph serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<neo4rs::Error> for GraphError {
    fn from(e: neo4rs::Error) -> Self {
        Self::Query(e.to_string())
    }
}

impl From<GraphError> for CoreError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::Connection(m) | GraphError::Query(m) => Self::UpstreamUnavailable(m),
            GraphError::Schema(m) => Self::Fatal(m),
            GraphError::InvalidInput(m) | GraphError::Unsupported(m) => Self::InvalidInput(m),
            GraphError::Serialization(e) => Self::InvalidInput(e.to_string()),
        }
    }
}
