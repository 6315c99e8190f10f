//! Graph-backed conversation persistence
//!
//! Message storage is serialized per conversation: a `DashMap` of async
//! mutexes guarantees that `total_chars` accumulation and summary
//! triggering are linearizable per conversation while different
//! conversations proceed in parallel.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::summarizer::HierarchicalSummarizer;
use crate::types::{Conversation, ConversationStatus, Message, Summary, ToolCallRecord};
use codebrain_graph::{EdgeRow, GraphStore, KeySpec};

/// Conversation store over the shared graph
pub struct ConversationStore {
    graph: Arc<dyn GraphStore>,
    summarizer: Option<Arc<HierarchicalSummarizer>>,
    message_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ConversationStore {
    /// Create a store without summarization (tests, import tooling)
    #[must_use]
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            summarizer: None,
            message_locks: DashMap::new(),
        }
    }

    /// Attach the summarizer that runs after each stored message
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<HierarchicalSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Create and persist a new conversation
    ///
    /// # Errors
    ///
    /// Fails if the graph write fails.
    pub async fn create_conversation(
        &self,
        title: impl Into<String>,
        tags: Vec<String>,
    ) -> Result<Conversation> {
        let conversation = Conversation::new(title, tags);
        self.graph
            .upsert_nodes("Conversation", "uuid", vec![conversation.to_props()])
            .await?;
        info!(uuid = %conversation.uuid, "Conversation created");
        Ok(conversation)
    }

    /// Load one conversation
    ///
    /// # Errors
    ///
    /// `MemoryError::NotFound` if the uuid is unknown.
    pub async fn get_conversation(&self, uuid: Uuid) -> Result<Conversation> {
        let records = self
            .graph
            .find_nodes("Conversation", Some(("uuid", &json!(uuid.to_string()))))
            .await?;
        records
            .first()
            .map(Conversation::from_props)
            .transpose()?
            .ok_or_else(|| MemoryError::NotFound(format!("conversation {uuid}")))
    }

    /// All conversations, newest first
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let records = self.graph.find_nodes("Conversation", None).await?;
        let mut conversations: Vec<Conversation> = records
            .iter()
            .map(Conversation::from_props)
            .collect::<Result<_>>()?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    /// Mark a conversation archived
    pub async fn archive(&self, uuid: Uuid) -> Result<Conversation> {
        let mut conversation = self.get_conversation(uuid).await?;
        conversation.status = ConversationStatus::Archived;
        conversation.updated_at = chrono::Utc::now();
        self.graph
            .upsert_nodes("Conversation", "uuid", vec![conversation.to_props()])
            .await?;
        Ok(conversation)
    }

    /// Delete a conversation and everything hanging off it
    pub async fn delete_conversation(&self, uuid: Uuid) -> Result<usize> {
        let filter = json!(uuid.to_string());
        let mut deleted = 0;

        for message in self
            .graph
            .find_nodes("Message", Some(("conversation_id", &filter)))
            .await?
        {
            if let Some(message_id) = message["uuid"].as_str() {
                for call in self
                    .graph
                    .find_nodes("ToolCall", Some(("message_id", &json!(message_id))))
                    .await?
                {
                    if let Some(call_id) = call["uuid"].as_str() {
                        deleted += self
                            .graph
                            .delete_by_key("ToolCall", "uuid", &json!(call_id), false)
                            .await?;
                    }
                }
                deleted += self
                    .graph
                    .delete_by_key("Message", "uuid", &json!(message_id), false)
                    .await?;
            }
        }

        for summary in self
            .graph
            .find_nodes("Summary", Some(("conversation_id", &filter)))
            .await?
        {
            if let Some(summary_id) = summary["uuid"].as_str() {
                deleted += self
                    .graph
                    .delete_by_key("Summary", "uuid", &json!(summary_id), false)
                    .await?;
            }
        }

        deleted += self
            .graph
            .delete_by_key("Conversation", "uuid", &filter, false)
            .await?;
        self.message_locks.remove(&uuid);
        info!(%uuid, deleted, "Conversation deleted");
        Ok(deleted)
    }

    /// Store one message, update the conversation clock, and run the
    /// summary cascade. Returns the summaries the cascade created.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown conversation; graph and summarizer
    /// failures propagate.
    pub async fn store_message(&self, message: Message) -> Result<Vec<Summary>> {
        let lock = self.conversation_lock(message.conversation_id);
        let _guard = lock.lock().await;

        let mut conversation = self.get_conversation(message.conversation_id).await?;

        // One logical transaction: message + tool calls + counters. Each
        // write is idempotent, so a crash mid-way is repaired by replay.
        let mut props = message.to_props();
        props.insert("seq".to_string(), json!(conversation.message_count));
        self.graph
            .upsert_nodes("Message", "uuid", vec![props])
            .await?;
        self.graph
            .upsert_edges(
                "HAS_MESSAGE",
                &KeySpec::new("Conversation", "uuid"),
                &KeySpec::new("Message", "uuid"),
                vec![EdgeRow {
                    from: json!(conversation.uuid.to_string()),
                    to: json!(message.uuid.to_string()),
                    properties: serde_json::Map::new(),
                }],
            )
            .await?;

        if !message.tool_calls.is_empty() {
            let rows = message.tool_calls.iter().map(ToolCallRecord::to_props).collect();
            self.graph.upsert_nodes("ToolCall", "uuid", rows).await?;
            let edges = message
                .tool_calls
                .iter()
                .map(|call| EdgeRow {
                    from: json!(message.uuid.to_string()),
                    to: json!(call.uuid.to_string()),
                    properties: serde_json::Map::new(),
                })
                .collect();
            self.graph
                .upsert_edges(
                    "HAS_TOOL_CALL",
                    &KeySpec::new("Message", "uuid"),
                    &KeySpec::new("ToolCall", "uuid"),
                    edges,
                )
                .await?;
        }

        conversation.message_count += 1;
        conversation.total_chars += message.char_count;
        conversation.updated_at = chrono::Utc::now();
        self.graph
            .upsert_nodes("Conversation", "uuid", vec![conversation.to_props()])
            .await?;
        debug!(
            conversation = %conversation.uuid,
            total_chars = conversation.total_chars,
            "Message stored"
        );

        // Summaries are created after storage, as many levels as trigger.
        if let Some(summarizer) = &self.summarizer {
            return summarizer.run_cascade(&conversation).await;
        }
        Ok(Vec::new())
    }

    /// Messages of a conversation in insertion order, tool calls attached
    pub async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let filter = json!(conversation_id.to_string());
        let mut records = self
            .graph
            .find_nodes("Message", Some(("conversation_id", &filter)))
            .await?;
        records.sort_by_key(|r| r["seq"].as_u64().unwrap_or(0));

        let mut messages = Vec::with_capacity(records.len());
        for record in &records {
            let message_id = record["uuid"].as_str().unwrap_or_default();
            let mut calls: Vec<ToolCallRecord> = self
                .graph
                .find_nodes("ToolCall", Some(("message_id", &json!(message_id))))
                .await?
                .iter()
                .map(ToolCallRecord::from_props)
                .collect::<Result<_>>()?;
            calls.sort_by_key(|c| c.started_at);
            messages.push(Message::from_props(record, calls)?);
        }
        Ok(messages)
    }

    /// Summaries of a conversation, optionally restricted to one level,
    /// in stream order
    pub async fn summaries(
        &self,
        conversation_id: Uuid,
        level: Option<u8>,
    ) -> Result<Vec<Summary>> {
        let filter = json!(conversation_id.to_string());
        let records = self
            .graph
            .find_nodes("Summary", Some(("conversation_id", &filter)))
            .await?;
        let mut summaries: Vec<Summary> = records
            .iter()
            .filter(|r| level.map_or(true, |l| r["level"].as_u64() == Some(u64::from(l))))
            .map(Summary::from_props)
            .collect::<Result<_>>()?;
        summaries.sort_by_key(|s| (s.level, s.char_range_start));
        Ok(summaries)
    }

    /// Export a conversation with messages, tool calls, and summaries
    pub async fn export(&self, conversation_id: Uuid) -> Result<Value> {
        let conversation = self.get_conversation(conversation_id).await?;
        let messages = self.messages(conversation_id).await?;
        let summaries = self.summaries(conversation_id, None).await?;
        Ok(json!({
            "conversation": conversation,
            "messages": messages,
            "summaries": summaries,
        }))
    }

    /// Reconstruct a conversation from an export payload
    ///
    /// Importing the same payload twice is a no-op thanks to MERGE
    /// semantics on every node.
    ///
    /// # Errors
    ///
    /// `InvalidInput` on malformed payloads.
    pub async fn import(&self, payload: &Value) -> Result<Conversation> {
        let conversation: Conversation =
            serde_json::from_value(payload["conversation"].clone())
                .map_err(|e| MemoryError::InvalidInput(format!("bad conversation: {e}")))?;
        let messages: Vec<Message> = serde_json::from_value(payload["messages"].clone())
            .map_err(|e| MemoryError::InvalidInput(format!("bad messages: {e}")))?;
        let summaries: Vec<Summary> = serde_json::from_value(payload["summaries"].clone())
            .map_err(|e| MemoryError::InvalidInput(format!("bad summaries: {e}")))?;

        self.graph
            .upsert_nodes("Conversation", "uuid", vec![conversation.to_props()])
            .await?;

        for (seq, message) in messages.iter().enumerate() {
            let mut props = message.to_props();
            props.insert("seq".to_string(), json!(seq));
            self.graph
                .upsert_nodes("Message", "uuid", vec![props])
                .await?;
            if !message.tool_calls.is_empty() {
                let rows = message.tool_calls.iter().map(ToolCallRecord::to_props).collect();
                self.graph.upsert_nodes("ToolCall", "uuid", rows).await?;
            }
        }

        for summary in &summaries {
            self.graph
                .upsert_nodes("Summary", "uuid", vec![summary.to_props()])
                .await?;
        }

        info!(
            uuid = %conversation.uuid,
            messages = messages.len(),
            summaries = summaries.len(),
            "Conversation imported"
        );
        Ok(conversation)
    }

    fn conversation_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.message_locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::summarizer::{ConversationSummarizer, SummaryText};
    use crate::types::Role;
    use async_trait::async_trait;
    use codebrain_graph::MemoryGraphStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted summarizer: returns fixed-size summaries and counts calls
    struct FixedSummarizer {
        calls: AtomicUsize,
        summary_len: usize,
    }

    #[async_trait]
    impl ConversationSummarizer for FixedSummarizer {
        async fn summarize(&self, _transcript: &str) -> Result<SummaryText> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SummaryText {
                conversation_summary: "c".repeat(self.summary_len / 2),
                actions_summary: "a".repeat(self.summary_len / 2),
            })
        }
    }

    fn bare_store() -> ConversationStore {
        ConversationStore::new(Arc::new(MemoryGraphStore::new()))
    }

    fn summarizing_store(
        trigger: usize,
        summary_len: usize,
    ) -> (ConversationStore, Arc<FixedSummarizer>) {
        let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
        let llm = Arc::new(FixedSummarizer {
            calls: AtomicUsize::new(0),
            summary_len,
        });
        let config = MemoryConfig {
            summary_trigger_chars: trigger,
            ..MemoryConfig::default()
        };
        let summarizer = Arc::new(HierarchicalSummarizer::new(
            Arc::clone(&graph),
            Arc::clone(&llm) as Arc<dyn ConversationSummarizer>,
            None,
            config,
        ));
        let store = ConversationStore::new(graph).with_summarizer(summarizer);
        (store, llm)
    }

    #[tokio::test]
    async fn test_total_chars_is_sum_of_char_counts() {
        let store = bare_store();
        let conversation = store.create_conversation("t", vec![]).await.unwrap();

        for content in ["hello", "wörld", "0123456789"] {
            store
                .store_message(Message::new(conversation.uuid, Role::User, content))
                .await
                .unwrap();
        }

        let loaded = store.get_conversation(conversation.uuid).await.unwrap();
        assert_eq!(loaded.message_count, 3);
        assert_eq!(loaded.total_chars, 5 + 5 + 10);

        let messages = store.messages(conversation.uuid).await.unwrap();
        let sum: usize = messages.iter().map(|m| m.char_count).sum();
        assert_eq!(loaded.total_chars, sum);
    }

    #[tokio::test]
    async fn test_messages_come_back_in_insertion_order() {
        let store = bare_store();
        let conversation = store.create_conversation("t", vec![]).await.unwrap();
        for i in 0..5 {
            store
                .store_message(Message::new(
                    conversation.uuid,
                    Role::User,
                    format!("msg {i}"),
                ))
                .await
                .unwrap();
        }
        let messages = store.messages(conversation.uuid).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn test_unknown_conversation_rejected() {
        let store = bare_store();
        let err = store
            .store_message(Message::new(Uuid::new_v4(), Role::User, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_l1_summaries_trigger_on_char_crossings() {
        let (store, llm) = summarizing_store(1000, 100);
        let conversation = store.create_conversation("t", vec![]).await.unwrap();

        // 400 chars per message: the uncovered suffix crosses the
        // 1000-char trigger at 1200 and again at 2400.
        for _ in 0..6 {
            store
                .store_message(Message::new(
                    conversation.uuid,
                    Role::User,
                    "x".repeat(400),
                ))
                .await
                .unwrap();
        }

        let summaries = store.summaries(conversation.uuid, Some(1)).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);

        // Ranges are contiguous and cover a prefix.
        assert_eq!(summaries[0].char_range_start, 0);
        assert_eq!(summaries[0].char_range_end, 1200);
        assert_eq!(summaries[1].char_range_start, 1200);
        assert_eq!(summaries[1].char_range_end, 2400);
    }

    #[tokio::test]
    async fn test_l2_summary_references_consumed_l1s() {
        // L1 summaries are 600 chars each, so two of them cross the
        // 1000-char L2 trigger.
        let (store, _llm) = summarizing_store(1000, 600);
        let conversation = store.create_conversation("t", vec![]).await.unwrap();

        for _ in 0..6 {
            store
                .store_message(Message::new(
                    conversation.uuid,
                    Role::User,
                    "y".repeat(500),
                ))
                .await
                .unwrap();
        }

        let l1 = store.summaries(conversation.uuid, Some(1)).await.unwrap();
        assert!(l1.len() >= 2, "expected at least two L1 summaries");

        let l2 = store.summaries(conversation.uuid, Some(2)).await.unwrap();
        assert_eq!(l2.len(), 1);
        assert_eq!(l2[0].char_range_start, 0);
        assert_eq!(l2[0].char_range_end, 1200);
        assert_eq!(l2[0].parent_summaries.len(), 2);
        let l1_ids: Vec<Uuid> = l1.iter().map(|s| s.uuid).collect();
        for parent in &l2[0].parent_summaries {
            assert!(l1_ids.contains(parent));
        }
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let (store, _llm) = summarizing_store(50, 20);
        let conversation = store.create_conversation("t", vec!["tag".into()]).await.unwrap();
        store
            .store_message(
                Message::new(conversation.uuid, Role::User, "q".repeat(60)).with_tool_calls(
                    vec![ToolCallRecord {
                        uuid: Uuid::new_v4(),
                        message_id: Uuid::nil(),
                        tool_name: "brain_search".into(),
                        arguments: "{}".into(),
                        started_at: chrono::Utc::now(),
                        duration_ms: 3,
                        success: true,
                        iteration: 1,
                        result: None,
                    }],
                ),
            )
            .await
            .unwrap();

        let payload = store.export(conversation.uuid).await.unwrap();

        let other = bare_store();
        let imported = other.import(&payload).await.unwrap();
        assert_eq!(imported.uuid, conversation.uuid);

        let reexported = other.export(conversation.uuid).await.unwrap();
        assert_eq!(payload["conversation"], reexported["conversation"]);
        assert_eq!(
            payload["messages"].as_array().unwrap().len(),
            reexported["messages"].as_array().unwrap().len()
        );
        assert_eq!(
            payload["summaries"].as_array().unwrap().len(),
            reexported["summaries"].as_array().unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (store, _llm) = summarizing_store(50, 20);
        let conversation = store.create_conversation("t", vec![]).await.unwrap();
        store
            .store_message(Message::new(conversation.uuid, Role::User, "z".repeat(80)))
            .await
            .unwrap();

        let deleted = store.delete_conversation(conversation.uuid).await.unwrap();
        assert!(deleted >= 3); // conversation + message + summary
        assert!(store.get_conversation(conversation.uuid).await.is_err());
        assert!(store.messages(conversation.uuid).await.unwrap().is_empty());
    }
}
