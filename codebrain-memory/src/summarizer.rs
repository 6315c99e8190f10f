//! Character-clocked hierarchical summarization
//!
//! Level 1 summarizes raw messages; level ℓ summarizes the stream of
//! level-(ℓ−1) summaries, treating their `summary_char_count`s as a
//! linear char stream. A level triggers when the uncovered suffix of its
//! stream reaches the configured threshold. Ranges are contiguous by
//! construction: each new summary starts where the previous one ended and
//! ends at the current stream total.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::types::{Conversation, Message, Summary};
use codebrain_embeddings::EmbeddingModel;
use codebrain_graph::GraphStore;

/// The LLM seam for summarization
#[async_trait]
pub trait ConversationSummarizer: Send + Sync {
    /// Produce the two 3–4 line summaries from a transcript block
    async fn summarize(&self, transcript: &str) -> Result<SummaryText>;
}

/// What the LLM returns for one summarization call
#[derive(Debug, Clone)]
pub struct SummaryText {
    /// What was discussed
    pub conversation_summary: String,
    /// What was done (tools, files, decisions)
    pub actions_summary: String,
}

/// Runs the level cascade after each stored message
pub struct HierarchicalSummarizer {
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn ConversationSummarizer>,
    embedder: Option<Arc<dyn EmbeddingModel>>,
    config: MemoryConfig,
}

impl HierarchicalSummarizer {
    /// Create a summarizer
    #[must_use]
    pub fn new(
        graph: Arc<dyn GraphStore>,
        llm: Arc<dyn ConversationSummarizer>,
        embedder: Option<Arc<dyn EmbeddingModel>>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            graph,
            llm,
            embedder,
            config,
        }
    }

    /// Run the cascade L1 → Lmax; returns the summaries created
    ///
    /// `conversation` must already reflect the message that triggered the
    /// call (its `total_chars` is the L1 stream total).
    ///
    /// # Errors
    ///
    /// LLM and graph failures abort the cascade; already-created levels
    /// stay stored and the next message retries the rest.
    pub async fn run_cascade(&self, conversation: &Conversation) -> Result<Vec<Summary>> {
        let mut created = Vec::new();

        if let Some(summary) = self.maybe_summarize_level1(conversation).await? {
            created.push(summary);
        }

        for level in 2..=self.config.max_summary_level {
            if let Some(summary) = self.maybe_summarize_level(conversation, level).await? {
                created.push(summary);
            }
        }

        Ok(created)
    }

    async fn maybe_summarize_level1(
        &self,
        conversation: &Conversation,
    ) -> Result<Option<Summary>> {
        let covered = self.covered_end(conversation.uuid, 1).await?;
        let total = conversation.total_chars;
        if total.saturating_sub(covered) < self.config.summary_trigger_chars {
            return Ok(None);
        }

        // Walk messages in insertion order; each occupies
        // (position, position + char_count] of the L1 stream.
        let messages = self.load_messages(conversation.uuid).await?;
        let mut position = 0usize;
        let mut transcript = String::new();
        for message in &messages {
            let end = position + message.char_count;
            if end > covered {
                let _ = writeln!(
                    transcript,
                    "[{}] {}",
                    message.role.as_str(),
                    message.content
                );
            }
            position = end;
        }

        let summary = self
            .create_summary(conversation.uuid, 1, covered, total, &transcript, Vec::new())
            .await?;
        Ok(Some(summary))
    }

    async fn maybe_summarize_level(
        &self,
        conversation: &Conversation,
        level: u8,
    ) -> Result<Option<Summary>> {
        let lower = self.summaries_at(conversation.uuid, level - 1).await?;
        let stream_total: usize = lower.iter().map(|s| s.summary_char_count).sum();
        let covered = self.covered_end(conversation.uuid, level).await?;
        if stream_total.saturating_sub(covered) < self.config.summary_trigger_chars {
            return Ok(None);
        }

        let mut position = 0usize;
        let mut transcript = String::new();
        let mut parents = Vec::new();
        for summary in &lower {
            let end = position + summary.summary_char_count;
            if end > covered {
                let _ = writeln!(transcript, "{}", summary.combined());
                parents.push(summary.uuid);
            }
            position = end;
        }

        let summary = self
            .create_summary(
                conversation.uuid,
                level,
                covered,
                stream_total,
                &transcript,
                parents,
            )
            .await?;
        Ok(Some(summary))
    }

    async fn create_summary(
        &self,
        conversation_id: Uuid,
        level: u8,
        range_start: usize,
        range_end: usize,
        transcript: &str,
        parents: Vec<Uuid>,
    ) -> Result<Summary> {
        let text = self.llm.summarize(transcript).await?;
        let summary_char_count =
            text.conversation_summary.chars().count() + text.actions_summary.chars().count();

        let mut summary = Summary {
            uuid: Uuid::new_v4(),
            conversation_id,
            level,
            char_range_start: range_start,
            char_range_end: range_end,
            summary_char_count,
            conversation_summary: text.conversation_summary,
            actions_summary: text.actions_summary,
            created_at: Utc::now(),
            embedding: None,
            parent_summaries: parents,
        };

        if let Some(embedder) = &self.embedder {
            match embedder.embed(&[summary.combined()]).await {
                Ok(mut vectors) if !vectors.is_empty() => {
                    summary.embedding = Some(vectors.remove(0));
                }
                Ok(_) => {}
                Err(e) => {
                    // Retrieval degrades without the vector, nothing else.
                    warn!(error = %e, "Summary embedding failed");
                }
            }
        }

        self.graph
            .upsert_nodes("Summary", "uuid", vec![summary.to_props()])
            .await?;

        info!(
            conversation = %conversation_id,
            level,
            range_start,
            range_end,
            "Summary created"
        );
        Ok(summary)
    }

    /// Highest `char_range_end` among summaries of one level
    async fn covered_end(&self, conversation_id: Uuid, level: u8) -> Result<usize> {
        Ok(self
            .summaries_at(conversation_id, level)
            .await?
            .iter()
            .map(|s| s.char_range_end)
            .max()
            .unwrap_or(0))
    }

    /// Summaries of one level, in stream order
    pub(crate) async fn summaries_at(
        &self,
        conversation_id: Uuid,
        level: u8,
    ) -> Result<Vec<Summary>> {
        let records = self
            .graph
            .find_nodes(
                "Summary",
                Some(("conversation_id", &json!(conversation_id.to_string()))),
            )
            .await?;
        let mut summaries: Vec<Summary> = records
            .iter()
            .filter(|r| r["level"].as_u64() == Some(u64::from(level)))
            .map(Summary::from_props)
            .collect::<Result<_>>()?;
        summaries.sort_by_key(|s| s.char_range_start);
        debug!(level, count = summaries.len(), "Loaded summaries");
        Ok(summaries)
    }

    async fn load_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let mut records = self
            .graph
            .find_nodes(
                "Message",
                Some(("conversation_id", &json!(conversation_id.to_string()))),
            )
            .await?;
        records.sort_by_key(|r| r["seq"].as_u64().unwrap_or(0));
        records
            .iter()
            .map(|r| Message::from_props(r, Vec::new()))
            .collect()
    }
}

/// Prompt block sent to the LLM by production summarizer implementations
#[must_use]
pub fn summarization_prompt(transcript: &str) -> String {
    format!(
        "Summarize the following conversation segment.\n\
         Respond with two short blocks.\n\
         CONVERSATION (3-4 lines): what was discussed.\n\
         ACTIONS (3-4 lines): what was done (tools run, files touched, decisions).\n\n\
         {transcript}"
    )
}
