//! Prompt-extraction dumps
//!
//! `extract_agent_prompt` materializes everything one iteration saw into
//! a timestamped debug directory, one artifact per file, and returns the
//! absolute path of each.

use serde_json::{json, Value};
use std::path::Path;

use crate::error::{AgentError, Result};

/// Artifacts of one extraction
pub struct ExtractionInput<'a> {
    pub prompt: &'a str,
    pub response: &'a str,
    /// Present only when a conversation was active
    pub enriched_context: Option<&'a str>,
    pub parsed_response: &'a Value,
    pub metadata: Value,
}

/// Write a `debug/extract_<ts>/` dump and return the file inventory
///
/// # Errors
///
/// Fails if the directory or any file cannot be written.
pub fn write_extraction_dump(dir: &Path, input: &ExtractionInput<'_>) -> Result<Value> {
    std::fs::create_dir_all(dir).map_err(|e| AgentError::Audit(e.to_string()))?;

    let write = |name: &str, contents: &str| -> Result<String> {
        let path = dir.join(name);
        std::fs::write(&path, contents).map_err(|e| AgentError::Audit(e.to_string()))?;
        Ok(path.display().to_string())
    };

    let mut files = json!({
        "prompt": write("prompt.txt", input.prompt)?,
        "response": write("response.txt", input.response)?,
        "parsed_response": write(
            "parsed_response.json",
            &serde_json::to_string_pretty(input.parsed_response)
                .map_err(|e| AgentError::Audit(e.to_string()))?,
        )?,
        "metadata": write(
            "metadata.json",
            &serde_json::to_string_pretty(&input.metadata)
                .map_err(|e| AgentError::Audit(e.to_string()))?,
        )?,
    });

    if let Some(context) = input.enriched_context {
        files["enriched_context"] = json!(write("enriched_context.txt", context)?);
    }

    Ok(json!({
        "extract_dir": dir.display().to_string(),
        "files": files,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_writes_all_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("extract_2026-02-01T10-00-00");

        let parsed = json!({"items": []});
        let inventory = write_extraction_dump(
            &dir,
            &ExtractionInput {
                prompt: "the prompt",
                response: "<items></items>",
                enriched_context: Some("## Conversation Context"),
                parsed_response: &parsed,
                metadata: json!({"iteration": 2, "question": "explain foo"}),
            },
        )
        .unwrap();

        for name in [
            "prompt.txt",
            "response.txt",
            "enriched_context.txt",
            "parsed_response.json",
            "metadata.json",
        ] {
            assert!(dir.join(name).exists(), "missing {name}");
        }
        assert!(inventory["files"]["prompt"]
            .as_str()
            .unwrap()
            .ends_with("prompt.txt"));
    }

    #[test]
    fn test_context_file_omitted_without_conversation() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("extract_x");
        let parsed = json!({});
        let inventory = write_extraction_dump(
            &dir,
            &ExtractionInput {
                prompt: "p",
                response: "r",
                enriched_context: None,
                parsed_response: &parsed,
                metadata: json!({}),
            },
        )
        .unwrap();
        assert!(!dir.join("enriched_context.txt").exists());
        assert!(inventory["files"].get("enriched_context").is_none());
    }
}
