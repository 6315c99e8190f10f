//! Error taxonomy shared across component boundaries
//!
//! Component crates carry their own error enums; at every boundary they are
//! converted into one of these kinds so the daemon can decide uniformly
//! whether to retry, surface, or exit. Raw sources are logged at the
//! conversion site and never travel over HTTP.

use thiserror::Error;

/// Result type alias for operations crossing component boundaries
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors classified by how the daemon must react to them
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed JSON, missing required fields, unknown tool. Surfaced to
    /// the caller, never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operation would violate lock ordering and the caller asked for
    /// no-wait semantics.
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// Graph database, LLM, or embedding provider unreachable. Retried
    /// with backoff inside ingestion and embedding batches, surfaced as a
    /// tool error otherwise.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A lock wait or startup poll exceeded its budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Logged and swallowed where it cannot affect correctness (EPIPE on
    /// log mirrors, subscriber callback failures, export failures).
    #[error("Transient: {0}")]
    Transient(String),

    /// Bind failure, corrupt PID file, schema rejected. The daemon exits
    /// non-zero on these.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether a batched operation should retry after seeing this error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_) | Self::Transient(_))
    }

    /// Whether the daemon must exit when this error reaches the top level
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(e.to_string()),
            std::io::ErrorKind::BrokenPipe => Self::Transient(e.to_string()),
            _ => Self::UpstreamUnavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::UpstreamUnavailable("neo4j down".into()).is_retryable());
        assert!(CoreError::Transient("epipe".into()).is_retryable());
        assert!(!CoreError::InvalidInput("bad json".into()).is_retryable());
        assert!(!CoreError::Fatal("bind failed".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::Fatal("schema rejected".into()).is_fatal());
        assert!(!CoreError::Timeout("lock wait".into()).is_fatal());
    }

    #[test]
    fn test_broken_pipe_maps_to_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "epipe");
        assert!(matches!(CoreError::from(io), CoreError::Transient(_)));
    }
}
