//! The dual recent + retrieved context builder

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use codebrain_core::{LockRegistry, EMBEDDING_LOCK, INGESTION_LOCK};
use codebrain_embeddings::EmbeddingModel;
use codebrain_graph::{GraphStore, VectorSearchOptions};
use codebrain_memory::{MemoryConfig, Message, Summary};

/// How long retrieval waits for each write lock before going stale
const LOCK_WAIT: Duration = Duration::from_secs(5);
/// Tool results inside the recent block are cut at this length
const RESULT_TRUNCATE: usize = 200;
/// Weight of the linear recency boost
const RECENCY_WEIGHT: f32 = 0.1;

/// The assembled context block plus bookkeeping
#[derive(Debug, Clone)]
pub struct EnrichedContext {
    /// The text prepended to the agent's system prompt
    pub text: String,
    /// Messages included in the recent block
    pub recent_messages: usize,
    /// Summaries included in the retrieved block
    pub retrieved_summaries: usize,
    /// True when a lock wait timed out and the graph may be mid-write
    pub stale: bool,
}

/// Assembles recent + retrieved context for one conversation
pub struct ContextBuilder {
    graph: Arc<dyn GraphStore>,
    store: Arc<codebrain_memory::ConversationStore>,
    locks: Arc<LockRegistry>,
    embedder: Option<Arc<dyn EmbeddingModel>>,
    config: MemoryConfig,
    /// Vector index the summaries are registered under
    summary_index: String,
}

impl ContextBuilder {
    /// Create a builder
    #[must_use]
    pub fn new(
        graph: Arc<dyn GraphStore>,
        store: Arc<codebrain_memory::ConversationStore>,
        locks: Arc<LockRegistry>,
        embedder: Option<Arc<dyn EmbeddingModel>>,
        config: MemoryConfig,
        summary_index: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            store,
            locks,
            embedder,
            config,
            summary_index: summary_index.into(),
        }
    }

    /// Build the context block for one query against one conversation
    ///
    /// # Errors
    ///
    /// Conversation lookups propagate; retrieval failures degrade to a
    /// recent-only block instead of failing the turn.
    pub async fn build(&self, conversation_id: Uuid, query: &str) -> Result<EnrichedContext> {
        // Best-effort visibility: wait for writers, tolerate timeout.
        let mut stale = false;
        for lock in [INGESTION_LOCK, EMBEDDING_LOCK] {
            if !self.locks.wait_for_unlock(lock, LOCK_WAIT).await {
                warn!(lock, "Lock did not drain; context may be stale");
                stale = true;
            }
        }

        let recent = self.recent_messages(conversation_id).await?;
        let retrieved = match self.retrieve_summaries(conversation_id, query).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Summary retrieval failed; recent-only context");
                Vec::new()
            }
        };

        let text = self.compose(&recent, &retrieved);
        debug!(
            recent = recent.len(),
            retrieved = retrieved.len(),
            stale,
            "Context assembled"
        );
        Ok(EnrichedContext {
            text,
            recent_messages: recent.len(),
            retrieved_summaries: retrieved.len(),
            stale,
        })
    }

    /// Newest messages within the char/turn budget, chronological order
    async fn recent_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let all = self.store.messages(conversation_id).await?;
        let mut chars = 0usize;
        let mut selected = Vec::new();

        for message in all.into_iter().rev() {
            if selected.len() >= self.config.recent_context_max_turns {
                break;
            }
            if chars + message.char_count > self.config.recent_context_max_chars
                && !selected.is_empty()
            {
                break;
            }
            chars += message.char_count;
            selected.push(message);
        }
        selected.reverse();
        Ok(selected)
    }

    /// Vector-retrieved summaries with level and recency boosts applied
    async fn retrieve_summaries(
        &self,
        conversation_id: Uuid,
        query: &str,
    ) -> Result<Vec<(Summary, f32)>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };

        let summaries = self.store.summaries(conversation_id, None).await?;
        if summaries.is_empty() {
            return Ok(Vec::new());
        }
        let uuids: Vec<String> = summaries.iter().map(|s| s.uuid.to_string()).collect();

        let mut vectors = embedder.embed(&[query.to_string()]).await?;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let query_embedding = vectors.remove(0);

        let hits = self
            .graph
            .vector_search(
                &self.summary_index,
                &query_embedding,
                self.config.rag_max_summaries,
                &VectorSearchOptions {
                    // The raw floor; the boosted threshold is applied below.
                    min_score: 0.0,
                    filter_uuids: Some(uuids),
                    extra_where: None,
                },
            )
            .await?;

        let now = Utc::now();
        let mut boosted: Vec<(Summary, f32)> = hits
            .iter()
            .filter_map(|hit| {
                let summary = summaries
                    .iter()
                    .find(|s| s.uuid.to_string() == hit.node_id)?;
                let age_days =
                    (now - summary.created_at).num_seconds() as f32 / 86_400.0;
                let recency =
                    (1.0 - age_days / self.config.recency_decay_days).clamp(0.0, 1.0);
                let score = hit.score
                    * self.config.level_boost(summary.level)
                    * (1.0 + RECENCY_WEIGHT * recency);
                Some((summary.clone(), score))
            })
            .filter(|(_, score)| *score >= self.config.rag_min_score)
            .collect();

        boosted.sort_by(|a, b| b.1.total_cmp(&a.1));
        boosted.truncate(self.config.rag_max_summaries);
        Ok(boosted)
    }

    fn compose(&self, recent: &[Message], retrieved: &[(Summary, f32)]) -> String {
        let mut out = String::from("## Conversation Context\n");
        let now = Utc::now();

        if !retrieved.is_empty() {
            out.push_str("\n### Related Earlier Discussion\n");
            for (summary, score) in retrieved {
                let age_days = (now - summary.created_at).num_days();
                out.push_str(&format!(
                    "[L{} — {}d — {:.0}%]\n{}\n{}\n\n",
                    summary.level,
                    age_days,
                    score * 100.0,
                    summary.conversation_summary,
                    summary.actions_summary,
                ));
            }
        }

        out.push_str("\n### Recent Conversation\n");
        for message in recent {
            out.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
            if let Some(reasoning) = &message.reasoning {
                out.push_str(&format!("  (reasoning: {reasoning})\n"));
            }
            for call in &message.tool_calls {
                out.push_str(&format!("  [tool {}({})", call.tool_name, call.arguments));
                if let Some(result) = &call.result {
                    out.push_str(&format!(" -> {}", truncate(result, RESULT_TRUNCATE)));
                }
                out.push_str("]\n");
            }
        }
        out
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codebrain_embeddings::LocalHashEmbedding;
    use codebrain_graph::MemoryGraphStore;
    use codebrain_memory::{
        ConversationStore, ConversationSummarizer, HierarchicalSummarizer, Role, SummaryText,
    };
    use codebrain_core::VectorIndexDef;

    struct EchoSummarizer;

    #[async_trait]
    impl ConversationSummarizer for EchoSummarizer {
        async fn summarize(
            &self,
            transcript: &str,
        ) -> codebrain_memory::Result<SummaryText> {
            let head: String = transcript.chars().take(40).collect();
            Ok(SummaryText {
                conversation_summary: format!("discussed: {head}"),
                actions_summary: "no actions".to_string(),
            })
        }
    }

    async fn fixture() -> (
        Arc<ConversationStore>,
        ContextBuilder,
        Uuid,
        Arc<LockRegistry>,
    ) {
        let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(LocalHashEmbedding::new(32));
        let locks = Arc::new(LockRegistry::new());

        graph
            .ensure_schema(
                &[],
                &[],
                &[VectorIndexDef {
                    name: "summary_embedding_index".into(),
                    node_label: "Summary".into(),
                    source_field: "combined".into(),
                    dimension: 32,
                    provider: "local".into(),
                    model: "local-hash".into(),
                }],
            )
            .await
            .unwrap();

        let config = MemoryConfig {
            summary_trigger_chars: 100,
            rag_min_score: 0.0,
            ..MemoryConfig::default()
        };
        let summarizer = Arc::new(HierarchicalSummarizer::new(
            Arc::clone(&graph),
            Arc::new(EchoSummarizer),
            Some(Arc::clone(&embedder)),
            config.clone(),
        ));
        let store = Arc::new(ConversationStore::new(Arc::clone(&graph)).with_summarizer(summarizer));
        let conversation = store.create_conversation("ctx", vec![]).await.unwrap();

        let builder = ContextBuilder::new(
            graph,
            Arc::clone(&store),
            Arc::clone(&locks),
            Some(embedder),
            config,
            "summary_embedding_index",
        );
        (store, builder, conversation.uuid, locks)
    }

    #[tokio::test]
    async fn test_recent_block_respects_turn_budget() {
        let (store, builder, conversation, _locks) = fixture().await;
        for i in 0..15 {
            store
                .store_message(Message::new(conversation, Role::User, format!("m{i}")))
                .await
                .unwrap();
        }

        let context = builder.build(conversation, "anything").await.unwrap();
        assert_eq!(context.recent_messages, 10);
        // Oldest messages fall out, newest stay, chronological order.
        assert!(context.text.contains("m14"));
        assert!(!context.text.contains("m4\n"));
        let p5 = context.text.find("m5").unwrap();
        let p14 = context.text.find("m14").unwrap();
        assert!(p5 < p14);
    }

    #[tokio::test]
    async fn test_retrieved_summaries_appear_with_annotation() {
        let (store, builder, conversation, _locks) = fixture().await;
        // Long messages push total_chars over the 100-char trigger.
        store
            .store_message(Message::new(
                conversation,
                Role::User,
                "lock registry design questions ".repeat(5),
            ))
            .await
            .unwrap();

        let context = builder
            .build(conversation, "lock registry design")
            .await
            .unwrap();
        assert!(context.retrieved_summaries >= 1);
        assert!(context.text.contains("[L1 — 0d —"));
        assert!(context.text.contains("Related Earlier Discussion"));
        assert!(!context.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_flag_on_lock_timeout() {
        let (store, builder, conversation, locks) = fixture().await;
        store
            .store_message(Message::new(conversation, Role::User, "hi"))
            .await
            .unwrap();

        // Hold the embedding lock through the whole build; the 5 s wait
        // auto-advances under paused time.
        let handle = locks.acquire(EMBEDDING_LOCK, "slow embed");
        let context = builder.build(conversation, "q").await.unwrap();
        assert!(context.stale);
        handle.release();
    }

    #[tokio::test]
    async fn test_tool_results_truncated() {
        let (store, builder, conversation, _locks) = fixture().await;
        let long_result = "r".repeat(500);
        store
            .store_message(
                Message::new(conversation, Role::Assistant, "ran a tool").with_tool_calls(vec![
                    codebrain_memory::ToolCallRecord {
                        uuid: Uuid::new_v4(),
                        message_id: Uuid::nil(),
                        tool_name: "run_cypher".into(),
                        arguments: "{}".into(),
                        started_at: Utc::now(),
                        duration_ms: 1,
                        success: true,
                        iteration: 1,
                        result: Some(long_result),
                    },
                ]),
            )
            .await
            .unwrap();

        let context = builder.build(conversation, "q").await.unwrap();
        assert!(context.text.contains("run_cypher"));
        assert!(!context.text.contains(&"r".repeat(300)));
    }
}
