//! Built-in filesystem tools
//!
//! All four tools operate relative to a fixed root and refuse paths that
//! escape it. `write_file` and `edit_file` are the mutating half that the
//! staged executor serializes ahead of parallel reads.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, ToolError};
use crate::registry::{Tool, ToolCategory, ToolRegistry};

/// Register the file tool family rooted at `root`
pub fn register_file_tools(registry: &ToolRegistry, root: PathBuf) {
    let root = Arc::new(root);
    registry.register(Arc::new(ReadFileTool {
        root: Arc::clone(&root),
    }));
    registry.register(Arc::new(WriteFileTool {
        root: Arc::clone(&root),
    }));
    registry.register(Arc::new(EditFileTool {
        root: Arc::clone(&root),
    }));
    registry.register(Arc::new(DeleteFileTool { root }));
}

fn resolve(root: &Path, raw: &str, tool: &str) -> Result<PathBuf> {
    let relative = Path::new(raw);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::InvalidArgs {
            tool: tool.to_string(),
            message: format!("path {raw} escapes the project root"),
        });
    }
    Ok(root.join(relative))
}

fn path_schema(extra: &[(&str, Value)]) -> Value {
    let mut properties = serde_json::Map::new();
    properties.insert("path".to_string(), json!({"type": "string"}));
    let mut required = vec![json!("path")];
    for (name, schema) in extra {
        properties.insert((*name).to_string(), schema.clone());
        required.push(json!(name));
    }
    json!({"type": "object", "properties": properties, "required": required})
}

struct ReadFileTool {
    root: Arc<PathBuf>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a file relative to the project root"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::File
    }
    fn input_schema(&self) -> Value {
        path_schema(&[])
    }
    async fn execute(&self, args: Value) -> Result<Value> {
        let path = resolve(&self.root, args["path"].as_str().unwrap_or_default(), "read_file")?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::execution("read_file", e))?;
        Ok(json!({"path": args["path"], "content": content}))
    }
}

struct WriteFileTool {
    root: Arc<PathBuf>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write (create or overwrite) a file relative to the project root"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::File
    }
    fn is_mutating(&self) -> bool {
        true
    }
    fn input_schema(&self) -> Value {
        path_schema(&[("content", json!({"type": "string"}))])
    }
    async fn execute(&self, args: Value) -> Result<Value> {
        let path = resolve(&self.root, args["path"].as_str().unwrap_or_default(), "write_file")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::execution("write_file", e))?;
        }
        let content = args["content"].as_str().unwrap_or_default();
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::execution("write_file", e))?;
        Ok(json!({"path": args["path"], "bytes_written": content.len()}))
    }
}

struct EditFileTool {
    root: Arc<PathBuf>,
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn description(&self) -> &str {
        "Replace an exact string in a file (must match exactly once)"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::File
    }
    fn is_mutating(&self) -> bool {
        true
    }
    fn input_schema(&self) -> Value {
        path_schema(&[
            ("old", json!({"type": "string"})),
            ("new", json!({"type": "string"})),
        ])
    }
    async fn execute(&self, args: Value) -> Result<Value> {
        let path = resolve(&self.root, args["path"].as_str().unwrap_or_default(), "edit_file")?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::execution("edit_file", e))?;

        let old = args["old"].as_str().unwrap_or_default();
        let new = args["new"].as_str().unwrap_or_default();
        let matches = content.matches(old).count();
        if matches != 1 {
            return Err(ToolError::InvalidArgs {
                tool: "edit_file".to_string(),
                message: format!("expected exactly one match for old string, found {matches}"),
            });
        }

        tokio::fs::write(&path, content.replacen(old, new, 1))
            .await
            .map_err(|e| ToolError::execution("edit_file", e))?;
        Ok(json!({"path": args["path"], "replaced": true}))
    }
}

struct DeleteFileTool {
    root: Arc<PathBuf>,
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }
    fn description(&self) -> &str {
        "Delete a file relative to the project root"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::File
    }
    fn is_mutating(&self) -> bool {
        true
    }
    fn input_schema(&self) -> Value {
        path_schema(&[])
    }
    async fn execute(&self, args: Value) -> Result<Value> {
        let path = resolve(
            &self.root,
            args["path"].as_str().unwrap_or_default(),
            "delete_file",
        )?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ToolError::execution("delete_file", e))?;
        Ok(json!({"path": args["path"], "deleted": true}))
    }
}
