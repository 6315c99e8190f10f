//! Context assembly for agent turns
//!
//! Every agent turn gets one text block assembled from two sources: the
//! most recent messages of the conversation (bounded by chars and turns)
//! and summaries retrieved by vector similarity, boosted by level and
//! recency. Retrieval is best-effort: the builder waits up to five
//! seconds for the ingestion and embedding locks and proceeds with a
//! `stale` marker if they do not drain.

pub mod builder;
pub mod error;

pub use builder::{ContextBuilder, EnrichedContext};
pub use error::{ContextError, Result};
