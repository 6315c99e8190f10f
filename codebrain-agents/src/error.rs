//! Error types for the agent executor

use codebrain_core::CoreError;
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised inside the agent loop
#[derive(Debug, Error)]
pub enum AgentError {
    /// The LLM provider failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// The response was not parseable even with tolerance applied
    #[error("Response parse error: {0}")]
    Parse(String),

    /// The loop was cancelled between iterations
    #[error("Agent run cancelled")]
    Cancelled,

    /// Context assembly failed
    #[error(transparent)]
    Context(#[from] codebrain_context::ContextError),

    /// Audit or extraction file write failed
    #[error("Audit write error: {0}")]
    Audit(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        Self::Provider(e.to_string())
    }
}

impl From<AgentError> for CoreError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Provider(m) => Self::UpstreamUnavailable(m),
            AgentError::Parse(m) => Self::InvalidInput(m),
            AgentError::Cancelled => Self::Timeout("agent run cancelled".to_string()),
            AgentError::Context(c) => c.into(),
            AgentError::Audit(m) => Self::Transient(m),
        }
    }
}
