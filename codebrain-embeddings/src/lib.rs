//! Embedding generation
//!
//! An [`EmbeddingModel`] turns batches of text into vectors; the
//! [`EmbeddingPipeline`] walks dirty graph nodes, embeds their source
//! fields, and writes the vectors back, clearing the dirty flag. The
//! pipeline holds the embedding lock for its whole run and never starts
//! while ingestion is in flight.

pub mod error;
pub mod pipeline;
pub mod provider;

pub use error::{EmbeddingError, Result};
pub use pipeline::{CombineStrategy, EmbedReport, EmbedRequest, EmbeddingPipeline};
pub use provider::{EmbeddingModel, LocalHashEmbedding, OpenAiEmbedding};
