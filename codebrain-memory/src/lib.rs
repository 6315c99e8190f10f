//! Conversation memory
//!
//! Conversations, messages, tool calls, and hierarchical summaries are
//! persisted in the same graph the code lives in, under their own labels.
//! `total_chars` is the clock: summaries trigger on accumulated character
//! counts rather than message counts, at every level, which keeps the
//! behavior stable across wildly different message-size distributions.

pub mod config;
pub mod error;
pub mod store;
pub mod summarizer;
pub mod types;

pub use config::MemoryConfig;
pub use error::{MemoryError, Result};
pub use store::ConversationStore;
pub use summarizer::{ConversationSummarizer, HierarchicalSummarizer, SummaryText};
pub use types::{
    Conversation, ConversationStatus, Message, Role, Summary, ToolCallRecord,
};
