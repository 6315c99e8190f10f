//! Per-session audit logging
//!
//! Every loop event appends an entry and rewrites the session file in
//! full, so a crashed process leaves a complete trail up to the crash.
//! The possibly-truncated final write on a hard kill is accepted.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// One audit entry
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub data: Value,
}

/// Session-scoped audit log, flushed on every entry
pub struct AuditLog {
    session_id: Uuid,
    path: PathBuf,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Create a log writing to `dir/agent-session-<uuid>.json`
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        let session_id = Uuid::new_v4();
        Self {
            path: dir.join(format!("agent-session-{session_id}.json")),
            session_id,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Session identifier
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Path of the session file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush the whole session to disk
    ///
    /// Write failures are logged and swallowed: losing audit data must
    /// not fail the agent run.
    pub fn record(&self, entry_type: &str, iteration: Option<u32>, data: Value) {
        let mut entries = self.entries.lock();
        entries.push(AuditEntry {
            entry_type: entry_type.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            iteration,
            data,
        });

        if let Err(e) = self.flush_locked(&entries) {
            warn!(error = %e, "Audit flush failed");
        }
    }

    /// Number of entries recorded so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn flush_locked(&self, entries: &[AuditEntry]) -> Result<()> {
        let session = serde_json::json!({
            "session_id": self.session_id.to_string(),
            "entries": entries,
        });
        let text = serde_json::to_string_pretty(&session)
            .map_err(|e| AgentError::Audit(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::Audit(e.to_string()))?;
        }
        std::fs::write(&self.path, text).map_err(|e| AgentError::Audit(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_record_flushes() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::new(tmp.path());

        log.record("iteration_start", Some(1), json!({"prompt_chars": 120}));
        let first = std::fs::read_to_string(log.path()).unwrap();
        assert!(first.contains("iteration_start"));

        log.record("tool_result", Some(1), json!({"tool": "brain_search"}));
        let second = std::fs::read_to_string(log.path()).unwrap();
        assert!(second.contains("iteration_start"));
        assert!(second.contains("tool_result"));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_session_file_is_valid_json() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::new(tmp.path());
        log.record("done", None, json!({}));

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(log.path()).unwrap()).unwrap();
        assert_eq!(parsed["entries"].as_array().unwrap().len(), 1);
        assert_eq!(
            parsed["session_id"].as_str().unwrap(),
            log.session_id().to_string()
        );
    }
}
