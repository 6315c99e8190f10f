//! Tool registry and dispatch
//!
//! Tools are named async handlers with JSON-schema inputs. The registry
//! adds two behaviors on top of plain dispatch: graph-read tools wait for
//! the ingestion and embedding locks (marking results `stale` on
//! timeout), and batched calls from one LLM response run in stages so a
//! parallel read can never race a just-emitted write.

pub mod error;
pub mod file_tools;
pub mod registry;
pub mod staged;

pub use error::{Result, ToolError};
pub use file_tools::register_file_tools;
pub use registry::{
    InvocationOutcome, Tool, ToolCallLog, ToolCategory, ToolRegistry,
};
pub use staged::{BatchToolCall, BatchToolOutcome};
