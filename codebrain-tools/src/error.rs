//! Error types for tool dispatch

use codebrain_core::CoreError;
use thiserror::Error;

/// Result type alias for tool operations
pub type Result<T> = std::result::Result<T, ToolError>;

/// Errors raised by the registry and individual tools
#[derive(Debug, Error)]
pub enum ToolError {
    /// No tool registered under this name
    #[error("Unknown tool: {0}")]
    NotFound(String),

    /// Arguments failed schema validation
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArgs { tool: String, message: String },

    /// The tool itself failed
    #[error("Tool {tool} failed: {message}")]
    Execution { tool: String, message: String },
}

impl ToolError {
    /// Build an execution error from any displayable cause
    pub fn execution(tool: &str, cause: impl std::fmt::Display) -> Self {
        Self::Execution {
            tool: tool.to_string(),
            message: cause.to_string(),
        }
    }
}

impl From<ToolError> for CoreError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::NotFound(m) => Self::InvalidInput(format!("unknown tool: {m}")),
            ToolError::InvalidArgs { tool, message } => {
                Self::InvalidInput(format!("{tool}: {message}"))
            }
            ToolError::Execution { tool, message } => {
                Self::UpstreamUnavailable(format!("{tool}: {message}"))
            }
        }
    }
}
