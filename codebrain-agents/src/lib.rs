//! The agent executor
//!
//! One agent turn is a bounded loop: build a prompt (system text, tool
//! definitions, the task, accumulated tool results), call the LLM, parse
//! its XML response, dispatch the tool calls it requested through the
//! registry's staged executor, and repeat until a terminal output field
//! appears or the iteration budget runs out. Every step is appended to a
//! per-session audit file so a crash leaves a complete trail.

pub mod audit;
pub mod error;
pub mod extract;
pub mod agent_loop;
pub mod provider;
pub mod xml;

pub use agent_loop::{AgentLoop, AgentLoopConfig, AgentOutcome, AgentTask};
pub use audit::AuditLog;
pub use error::{AgentError, Result};
pub use extract::write_extraction_dump;
pub use provider::{CompletionModel, OpenAiChatModel, ScriptedCompletion};
pub use xml::{parse_agent_response, ParsedItem, ParsedResponse, ToolCallSpec};
