//! The tool registry

use async_trait::async_trait;
use dashmap::DashMap;
use jsonschema::JSONSchema;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, ToolError};
use codebrain_core::{sanitize, LockRegistry, EMBEDDING_LOCK, INGESTION_LOCK};

/// How long a wrapped graph-read tool waits for the write locks
const READ_LOCK_WAIT: Duration = Duration::from_millis(5000);
/// Recent tool-call records kept in memory
const CALL_LOG_CAP: usize = 1000;

/// Coarse grouping used for dispatch staging and discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    /// Graph operations: projects, ingestion, forget, search, cypher
    Brain,
    /// Filesystem operations
    File,
    /// Image / 3-D rendering, served by external processes
    Media,
    /// Project scaffolding and loading
    Project,
    /// Agent-facing orchestration
    Agent,
    /// Introspection and debugging
    Debug,
}

/// A named, schema-validated async handler
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name, unique
    fn name(&self) -> &str;

    /// One-line description shown to the LLM
    fn description(&self) -> &str;

    /// Category for staging and discovery
    fn category(&self) -> ToolCategory;

    /// JSON schema of the arguments object
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    /// Whether this tool mutates state (drives write-then-read staging)
    fn is_mutating(&self) -> bool {
        false
    }

    /// Run the tool
    async fn execute(&self, args: Value) -> Result<Value>;
}

/// One sanitized record of a successful call
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallLog {
    pub tool_name: String,
    pub sanitized_args: Value,
    pub duration_ms: u64,
    pub result_size: usize,
}

/// Result of one invocation through the registry
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    /// Tool result, possibly annotated with `stale: true`
    pub result: Value,
    pub duration_ms: u64,
    /// True when the lock wait timed out before a graph read
    pub stale: bool,
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: Option<JSONSchema>,
}

/// Holds every registered tool and enforces the dispatch discipline
pub struct ToolRegistry {
    tools: DashMap<String, Arc<RegisteredTool>>,
    locks: Arc<LockRegistry>,
    /// Names wrapped with the lock-await before execution
    graph_reads: Mutex<HashSet<String>>,
    call_log: Mutex<VecDeque<ToolCallLog>>,
}

impl ToolRegistry {
    /// Create an empty registry bound to the daemon's locks
    #[must_use]
    pub fn new(locks: Arc<LockRegistry>) -> Self {
        Self {
            tools: DashMap::new(),
            locks,
            graph_reads: Mutex::new(HashSet::new()),
            call_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a tool; replaces any previous tool of the same name
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let schema = match JSONSchema::compile(&tool.input_schema()) {
            Ok(schema) => Some(schema),
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool schema does not compile; skipping validation");
                None
            }
        };
        self.tools
            .insert(name.clone(), Arc::new(RegisteredTool { tool, schema }));
        debug!(tool = %name, "Tool registered");
    }

    /// Register a tool that reads live graph state
    ///
    /// Such tools are wrapped with a bounded wait on the ingestion and
    /// embedding locks; on timeout they run anyway and their result is
    /// annotated `stale: true`.
    pub fn register_graph_read(&self, tool: Arc<dyn Tool>) {
        self.graph_reads.lock().insert(tool.name().to_string());
        self.register(tool);
    }

    /// Whether a name resolves to a tool
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered tools
    #[must_use]
    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Category of a registered tool
    #[must_use]
    pub fn category_of(&self, name: &str) -> Option<ToolCategory> {
        self.tools.get(name).map(|t| t.tool.category())
    }

    /// Whether a registered tool mutates state
    #[must_use]
    pub fn is_mutating(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.tool.is_mutating())
    }

    /// Tool descriptions for the agent's tool-definition block
    #[must_use]
    pub fn definitions(&self) -> Vec<Value> {
        let mut defs: Vec<Value> = self
            .tools
            .iter()
            .map(|entry| {
                json!({
                    "name": entry.tool.name(),
                    "description": entry.tool.description(),
                    "category": entry.tool.category(),
                    "input_schema": entry.tool.input_schema(),
                })
            })
            .collect();
        defs.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        defs
    }

    /// Recent sanitized call records, newest last
    #[must_use]
    pub fn recent_calls(&self) -> Vec<ToolCallLog> {
        self.call_log.lock().iter().cloned().collect()
    }

    /// Invoke one tool by name
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown names, `InvalidArgs` on schema violations,
    /// `Execution` when the tool itself fails.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<InvocationOutcome> {
        let registered = self
            .tools
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if let Some(schema) = &registered.schema {
            if let Err(errors) = schema.validate(&args) {
                let message = errors
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ToolError::InvalidArgs {
                    tool: name.to_string(),
                    message,
                });
            }
        }

        // Graph reads drain writers first, best-effort.
        let mut stale = false;
        if self.graph_reads.lock().contains(name) {
            for lock in [INGESTION_LOCK, EMBEDDING_LOCK] {
                if !self.locks.wait_for_unlock(lock, READ_LOCK_WAIT).await {
                    warn!(tool = name, lock, "Write lock busy; read proceeds stale");
                    stale = true;
                }
            }
        }

        let started = Instant::now();
        let mut result = registered.tool.execute(args.clone()).await?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if stale {
            result = annotate_stale(result);
        }

        let result_size = result.to_string().len();
        self.record(ToolCallLog {
            tool_name: name.to_string(),
            sanitized_args: sanitize::sanitize_args(&args),
            duration_ms,
            result_size,
        });
        info!(tool = name, duration_ms, result_size, stale, "Tool call complete");

        Ok(InvocationOutcome {
            result,
            duration_ms,
            stale,
        })
    }

    fn record(&self, log: ToolCallLog) {
        let mut calls = self.call_log.lock();
        if calls.len() == CALL_LOG_CAP {
            calls.pop_front();
        }
        calls.push_back(log);
    }
}

fn annotate_stale(result: Value) -> Value {
    match result {
        Value::Object(mut fields) => {
            fields.insert("stale".to_string(), json!(true));
            Value::Object(fields)
        }
        other => json!({"value": other, "stale": true}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes its arguments"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Debug
        }
        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        async fn execute(&self, args: Value) -> Result<Value> {
            Ok(json!({"echoed": args["text"]}))
        }
    }

    fn registry() -> (Arc<LockRegistry>, ToolRegistry) {
        let locks = Arc::new(LockRegistry::new());
        let registry = ToolRegistry::new(Arc::clone(&locks));
        (locks, registry)
    }

    #[tokio::test]
    async fn test_invoke_and_record() {
        let (_locks, registry) = registry();
        registry.register(Arc::new(EchoTool));

        let outcome = registry
            .invoke("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(outcome.result, json!({"echoed": "hi"}));
        assert!(!outcome.stale);

        let calls = registry.recent_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "echo");
        assert!(calls[0].result_size > 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (_locks, registry) = registry();
        let err = registry.invoke("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_schema_rejection() {
        let (_locks, registry) = registry();
        registry.register(Arc::new(EchoTool));

        let err = registry
            .invoke("echo", json!({"wrong": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graph_read_marks_stale_under_held_lock() {
        let (locks, registry) = registry();
        registry.register_graph_read(Arc::new(EchoTool));

        let handle = locks.acquire(INGESTION_LOCK, "endless ingest");
        let outcome = registry
            .invoke("echo", json!({"text": "read"}))
            .await
            .unwrap();
        assert!(outcome.stale);
        assert_eq!(outcome.result["stale"], json!(true));
        assert_eq!(outcome.result["echoed"], json!("read"));
        handle.release();
    }

    #[tokio::test]
    async fn test_names_sorted() {
        let (_locks, registry) = registry();
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.names(), vec!["echo".to_string()]);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_sensitive_args_redacted_in_log() {
        let (_locks, registry) = registry();

        struct LoginTool;
        #[async_trait]
        impl Tool for LoginTool {
            fn name(&self) -> &str {
                "login"
            }
            fn description(&self) -> &str {
                "test"
            }
            fn category(&self) -> ToolCategory {
                ToolCategory::Debug
            }
            async fn execute(&self, _args: Value) -> Result<Value> {
                Ok(json!({"ok": true}))
            }
        }

        registry.register(Arc::new(LoginTool));
        registry
            .invoke("login", json!({"user": "a", "password": "hunter2"}))
            .await
            .unwrap();

        let calls = registry.recent_calls();
        assert_eq!(calls[0].sanitized_args["password"], json!("[redacted]"));
        assert_eq!(calls[0].sanitized_args["user"], json!("a"));
    }
}
