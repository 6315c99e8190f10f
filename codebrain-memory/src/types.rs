//! Conversation data model
//!
//! These structs mirror the graph representation one-to-one; conversion
//! to and from property maps lives next to each type so the store stays
//! free of field-name string soup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Whether a conversation still accepts messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Parse from the stored string form
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::InvalidInput` on unknown roles.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(MemoryError::InvalidInput(format!("unknown role {other}"))),
        }
    }

    /// Stored string form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A persisted conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub uuid: Uuid,
    pub title: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    /// Monotonic sum of `char_count` over all stored messages; the
    /// summarization clock
    pub total_chars: usize,
    pub status: ConversationStatus,
}

impl Conversation {
    /// Start a new active conversation
    #[must_use]
    pub fn new(title: impl Into<String>, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            title: title.into(),
            tags,
            created_at: now,
            updated_at: now,
            message_count: 0,
            total_chars: 0,
            status: ConversationStatus::Active,
        }
    }

    pub(crate) fn to_props(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("uuid".into(), json!(self.uuid.to_string()));
        m.insert("title".into(), json!(self.title));
        m.insert("tags".into(), json!(self.tags));
        m.insert("created_at".into(), json!(self.created_at.to_rfc3339()));
        m.insert("updated_at".into(), json!(self.updated_at.to_rfc3339()));
        m.insert("message_count".into(), json!(self.message_count));
        m.insert("total_chars".into(), json!(self.total_chars));
        m.insert("status".into(), json!(status_str(self.status)));
        m
    }

    pub(crate) fn from_props(props: &Value) -> Result<Self> {
        Ok(Self {
            uuid: parse_uuid(props, "uuid")?,
            title: str_field(props, "title"),
            tags: props["tags"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            created_at: time_field(props, "created_at"),
            updated_at: time_field(props, "updated_at"),
            message_count: usize_field(props, "message_count"),
            total_chars: usize_field(props, "total_chars"),
            status: if str_field(props, "status") == "archived" {
                ConversationStatus::Archived
            } else {
                ConversationStatus::Active
            },
        })
    }
}

/// One recorded tool invocation inside a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub uuid: Uuid,
    pub message_id: Uuid,
    pub tool_name: String,
    /// Stringified arguments, already sanitized
    pub arguments: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    /// Agent-loop iteration this call belonged to
    pub iteration: u32,
    pub result: Option<String>,
}

impl ToolCallRecord {
    pub(crate) fn to_props(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("uuid".into(), json!(self.uuid.to_string()));
        m.insert("message_id".into(), json!(self.message_id.to_string()));
        m.insert("tool_name".into(), json!(self.tool_name));
        m.insert("arguments".into(), json!(self.arguments));
        m.insert("started_at".into(), json!(self.started_at.to_rfc3339()));
        m.insert("duration_ms".into(), json!(self.duration_ms));
        m.insert("success".into(), json!(self.success));
        m.insert("iteration".into(), json!(self.iteration));
        if let Some(result) = &self.result {
            m.insert("result".into(), json!(result));
        }
        m
    }

    pub(crate) fn from_props(props: &Value) -> Result<Self> {
        Ok(Self {
            uuid: parse_uuid(props, "uuid")?,
            message_id: parse_uuid(props, "message_id")?,
            tool_name: str_field(props, "tool_name"),
            arguments: str_field(props, "arguments"),
            started_at: time_field(props, "started_at"),
            duration_ms: props["duration_ms"].as_u64().unwrap_or(0),
            success: props["success"].as_bool().unwrap_or(false),
            iteration: u32::try_from(props["iteration"].as_u64().unwrap_or(0)).unwrap_or(0),
            result: props["result"].as_str().map(str::to_string),
        })
    }
}

/// A persisted message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub reasoning: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Characters in `content`; summed into the conversation clock
    pub char_count: usize,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Message {
    /// Build a message for a conversation, computing `char_count`
    #[must_use]
    pub fn new(conversation_id: Uuid, role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            uuid: Uuid::new_v4(),
            conversation_id,
            role,
            char_count: content.chars().count(),
            content,
            reasoning: None,
            timestamp: Utc::now(),
            embedding: None,
            tool_calls: Vec::new(),
        }
    }

    /// Attach reasoning text
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Attach tool calls, fixing their `message_id`
    #[must_use]
    pub fn with_tool_calls(mut self, mut calls: Vec<ToolCallRecord>) -> Self {
        for call in &mut calls {
            call.message_id = self.uuid;
        }
        self.tool_calls = calls;
        self
    }

    pub(crate) fn to_props(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("uuid".into(), json!(self.uuid.to_string()));
        m.insert(
            "conversation_id".into(),
            json!(self.conversation_id.to_string()),
        );
        m.insert("role".into(), json!(self.role.as_str()));
        m.insert("content".into(), json!(self.content));
        m.insert("timestamp".into(), json!(self.timestamp.to_rfc3339()));
        m.insert("char_count".into(), json!(self.char_count));
        if let Some(reasoning) = &self.reasoning {
            m.insert("reasoning".into(), json!(reasoning));
        }
        m
    }

    pub(crate) fn from_props(props: &Value, tool_calls: Vec<ToolCallRecord>) -> Result<Self> {
        Ok(Self {
            uuid: parse_uuid(props, "uuid")?,
            conversation_id: parse_uuid(props, "conversation_id")?,
            role: Role::parse(&str_field(props, "role"))?,
            content: str_field(props, "content"),
            reasoning: props["reasoning"].as_str().map(str::to_string),
            timestamp: time_field(props, "timestamp"),
            char_count: usize_field(props, "char_count"),
            embedding: None,
            tool_calls,
        })
    }
}

/// A stored summary at some level of the hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub uuid: Uuid,
    pub conversation_id: Uuid,
    /// 1 for raw-message summaries, ℓ for summaries of (ℓ−1)-summaries
    pub level: u8,
    /// Start of the covered range in the level's char stream (exclusive)
    pub char_range_start: usize,
    /// End of the covered range (inclusive)
    pub char_range_end: usize,
    /// Characters of this summary's own text; feeds the next level's clock
    pub summary_char_count: usize,
    pub conversation_summary: String,
    pub actions_summary: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Level-(ℓ−1) summaries consumed, empty at level 1
    pub parent_summaries: Vec<Uuid>,
}

impl Summary {
    /// Combined text used for retrieval and embedding
    #[must_use]
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.conversation_summary, self.actions_summary)
    }

    pub(crate) fn to_props(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("uuid".into(), json!(self.uuid.to_string()));
        m.insert(
            "conversation_id".into(),
            json!(self.conversation_id.to_string()),
        );
        m.insert("level".into(), json!(self.level));
        m.insert("char_range_start".into(), json!(self.char_range_start));
        m.insert("char_range_end".into(), json!(self.char_range_end));
        m.insert("summary_char_count".into(), json!(self.summary_char_count));
        m.insert(
            "conversation_summary".into(),
            json!(self.conversation_summary),
        );
        m.insert("actions_summary".into(), json!(self.actions_summary));
        m.insert("created_at".into(), json!(self.created_at.to_rfc3339()));
        m.insert("combined".into(), json!(self.combined()));
        m.insert(
            "parent_summaries".into(),
            json!(self
                .parent_summaries
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()),
        );
        if let Some(embedding) = &self.embedding {
            m.insert("combined_embedding".into(), json!(embedding));
        }
        m
    }

    pub(crate) fn from_props(props: &Value) -> Result<Self> {
        Ok(Self {
            uuid: parse_uuid(props, "uuid")?,
            conversation_id: parse_uuid(props, "conversation_id")?,
            level: u8::try_from(props["level"].as_u64().unwrap_or(1)).unwrap_or(1),
            char_range_start: usize_field(props, "char_range_start"),
            char_range_end: usize_field(props, "char_range_end"),
            summary_char_count: usize_field(props, "summary_char_count"),
            conversation_summary: str_field(props, "conversation_summary"),
            actions_summary: str_field(props, "actions_summary"),
            created_at: time_field(props, "created_at"),
            embedding: None,
            parent_summaries: props["parent_summaries"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .filter_map(|s| Uuid::parse_str(s).ok())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

const fn status_str(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Active => "active",
        ConversationStatus::Archived => "archived",
    }
}

fn parse_uuid(props: &Value, field: &str) -> Result<Uuid> {
    let raw = props[field]
        .as_str()
        .ok_or_else(|| MemoryError::InvalidInput(format!("missing {field}")))?;
    Uuid::parse_str(raw).map_err(|e| MemoryError::InvalidInput(format!("bad {field}: {e}")))
}

fn str_field(props: &Value, field: &str) -> String {
    props[field].as_str().unwrap_or_default().to_string()
}

fn usize_field(props: &Value, field: &str) -> usize {
    usize::try_from(props[field].as_u64().unwrap_or(0)).unwrap_or(0)
}

fn time_field(props: &Value, field: &str) -> DateTime<Utc> {
    props[field]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_char_count_uses_chars_not_bytes() {
        let msg = Message::new(Uuid::new_v4(), Role::User, "héllo");
        assert_eq!(msg.char_count, 5);
    }

    #[test]
    fn test_conversation_roundtrip_through_props() {
        let conversation = Conversation::new("Test", vec!["rust".into()]);
        let props = Value::Object(conversation.to_props());
        let back = Conversation::from_props(&props).unwrap();
        assert_eq!(back.uuid, conversation.uuid);
        assert_eq!(back.title, "Test");
        assert_eq!(back.tags, vec!["rust".to_string()]);
        assert_eq!(back.status, ConversationStatus::Active);
    }

    #[test]
    fn test_message_roundtrip_with_tool_calls() {
        let conversation_id = Uuid::new_v4();
        let message = Message::new(conversation_id, Role::Assistant, "done")
            .with_reasoning("thought about it")
            .with_tool_calls(vec![ToolCallRecord {
                uuid: Uuid::new_v4(),
                message_id: Uuid::nil(),
                tool_name: "brain_search".into(),
                arguments: "{\"query\":\"foo\"}".into(),
                started_at: Utc::now(),
                duration_ms: 12,
                success: true,
                iteration: 1,
                result: Some("[]".into()),
            }]);

        assert_eq!(message.tool_calls[0].message_id, message.uuid);

        let calls = message
            .tool_calls
            .iter()
            .map(|c| ToolCallRecord::from_props(&Value::Object(c.to_props())).unwrap())
            .collect();
        let back =
            Message::from_props(&Value::Object(message.to_props()), calls).unwrap();
        assert_eq!(back.uuid, message.uuid);
        assert_eq!(back.reasoning.as_deref(), Some("thought about it"));
        assert_eq!(back.tool_calls.len(), 1);
        assert!(back.tool_calls[0].success);
    }

    #[test]
    fn test_summary_combined_text() {
        let summary = Summary {
            uuid: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            level: 1,
            char_range_start: 0,
            char_range_end: 100,
            summary_char_count: 20,
            conversation_summary: "talked about locks".into(),
            actions_summary: "wrote a test".into(),
            created_at: Utc::now(),
            embedding: None,
            parent_summaries: vec![],
        };
        assert_eq!(summary.combined(), "talked about locks\nwrote a test");
    }
}
