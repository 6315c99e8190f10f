//! Parsing, incremental ingestion, and file watching
//!
//! The pipeline from filesystem to graph: the watcher debounces change
//! events into batches, the parser turns changed files into a graph delta,
//! and the ingestor applies the delta under the ingestion lock, marking
//! nodes dirty for the embedding pipeline.

pub mod delta;
pub mod error;
pub mod ingestor;
pub mod parser;
pub mod scope_parser;
pub mod watcher;

pub use delta::{keys, EdgeSpec, GraphDelta, NodeSpec, ParseStats};
pub use error::{IngestError, Result};
pub use ingestor::{IncrementalIngestor, IngestReport};
pub use parser::{GlobFilter, ParseRequest, SourceParser};
pub use scope_parser::ScopeParser;
pub use watcher::{AfterIngestionHook, FileWatcher, WatcherConfig, WatcherStatus};
