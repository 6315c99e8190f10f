//! Built-in tools wired to daemon components
//!
//! Each tool holds a weak-free `Arc<DaemonState>` and calls
//! `ensure_brain()` at execution time, so registering tools never forces
//! a graph connection. Graph-reading tools are registered through
//! `register_graph_read` and inherit the lock-await + stale discipline.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state::DaemonState;
use codebrain_agents::{write_extraction_dump, AgentLoop, AgentLoopConfig, AgentTask, AuditLog};
use codebrain_graph::VectorSearchOptions;
use codebrain_ingest::ParseRequest;
use codebrain_tools::{register_file_tools, Tool, ToolCategory, ToolError};

/// Register every built-in tool on the state's registry
pub fn register_all(state: &Arc<DaemonState>) {
    register_file_tools(&state.tools, state.config.source.root.clone());

    state
        .tools
        .register_graph_read(Arc::new(ListProjectsTool(Arc::clone(state))));
    state
        .tools
        .register_graph_read(Arc::new(BrainSearchTool(Arc::clone(state))));
    state
        .tools
        .register_graph_read(Arc::new(RunCypherTool(Arc::clone(state))));
    state
        .tools
        .register_graph_read(Arc::new(ConversationStatsTool(Arc::clone(state))));

    state.tools.register(Arc::new(IngestPathTool(Arc::clone(state))));
    state.tools.register(Arc::new(ForgetPathTool(Arc::clone(state))));
    state.tools.register(Arc::new(EmbedDirtyTool(Arc::clone(state))));
    state
        .tools
        .register(Arc::new(CreateProjectTool(Arc::clone(state))));
    state.tools.register(Arc::new(AskAgentTool(Arc::clone(state))));
    state
        .tools
        .register(Arc::new(ExtractPromptTool(Arc::clone(state))));
}

fn exec_err(tool: &str, e: impl std::fmt::Display) -> ToolError {
    ToolError::execution(tool, e)
}

struct ListProjectsTool(Arc<DaemonState>);

#[async_trait]
impl Tool for ListProjectsTool {
    fn name(&self) -> &str {
        "list_brain_projects"
    }
    fn description(&self) -> &str {
        "List registered projects with watcher state"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Brain
    }
    async fn execute(&self, _args: Value) -> codebrain_tools::Result<Value> {
        Ok(json!({
            "projects": self.0.projects(),
            "watchers": self.0.watcher_statuses(),
        }))
    }
}

struct BrainSearchTool(Arc<DaemonState>);

#[async_trait]
impl Tool for BrainSearchTool {
    fn name(&self) -> &str {
        "brain_search"
    }
    fn description(&self) -> &str {
        "Semantic search over ingested code scopes"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Brain
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "top_k": {"type": "integer", "minimum": 1}
            },
            "required": ["query"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let brain = self
            .0
            .ensure_brain()
            .await
            .map_err(|e| exec_err("brain_search", e))?;
        let Some(embedder) = &brain.embedder else {
            return Err(exec_err("brain_search", "embeddings are not configured"));
        };

        let query = args["query"].as_str().unwrap_or_default();
        let top_k = usize::try_from(args["top_k"].as_u64().unwrap_or(10)).unwrap_or(10);

        let index = brain
            .vector_indexes
            .iter()
            .find(|i| i.node_label != "Summary")
            .ok_or_else(|| exec_err("brain_search", "no searchable index registered"))?;

        let mut vectors = embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| exec_err("brain_search", e))?;
        if vectors.is_empty() {
            return Ok(json!({"hits": []}));
        }

        let hits = brain
            .graph
            .vector_search(
                &index.name,
                &vectors.remove(0),
                top_k,
                &VectorSearchOptions::default(),
            )
            .await
            .map_err(|e| exec_err("brain_search", e))?;

        Ok(json!({
            "hits": hits
                .iter()
                .map(|h| json!({
                    "node_id": h.node_id,
                    "score": h.score,
                    "name": h.properties["name"],
                    "path": h.properties["path"],
                }))
                .collect::<Vec<_>>(),
        }))
    }
}

struct RunCypherTool(Arc<DaemonState>);

#[async_trait]
impl Tool for RunCypherTool {
    fn name(&self) -> &str {
        "run_cypher"
    }
    fn description(&self) -> &str {
        "Run a raw Cypher query against the knowledge graph"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Brain
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "params": {"type": "object"}
            },
            "required": ["query"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let brain = self
            .0
            .ensure_brain()
            .await
            .map_err(|e| exec_err("run_cypher", e))?;
        let query = args["query"].as_str().unwrap_or_default();
        let params = args.get("params").cloned().unwrap_or(Value::Null);

        let result = brain
            .graph
            .run(query, params)
            .await
            .map_err(|e| exec_err("run_cypher", e))?;
        Ok(json!({"records": result.records, "counters": result.counters}))
    }
}

struct IngestPathTool(Arc<DaemonState>);

#[async_trait]
impl Tool for IngestPathTool {
    fn name(&self) -> &str {
        "ingest_path"
    }
    fn description(&self) -> &str {
        "Parse and ingest a directory into the knowledge graph"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Brain
    }
    fn is_mutating(&self) -> bool {
        true
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "include": {"type": "array", "items": {"type": "string"}},
                "exclude": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["path"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let brain = self
            .0
            .ensure_brain()
            .await
            .map_err(|e| exec_err("ingest_path", e))?;

        let root = PathBuf::from(args["path"].as_str().unwrap_or_default());
        let globs = |key: &str, default: &str| -> Vec<String> {
            args[key]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec![default.to_string()])
        };

        let request = ParseRequest {
            root,
            include: globs("include", "**/*"),
            exclude: globs("exclude", "**/.git/**"),
            changed: None,
        };
        let delta = brain
            .parser
            .parse(&request)
            .await
            .map_err(|e| exec_err("ingest_path", e))?;
        let report = brain
            .ingestor
            .ingest(delta, &[])
            .await
            .map_err(|e| exec_err("ingest_path", e))?;

        Ok(json!({
            "created": report.created,
            "updated": report.updated,
            "removed": report.removed,
        }))
    }
}

struct ForgetPathTool(Arc<DaemonState>);

#[async_trait]
impl Tool for ForgetPathTool {
    fn name(&self) -> &str {
        "forget_path"
    }
    fn description(&self) -> &str {
        "Unregister a project and remove its project node"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Brain
    }
    fn is_mutating(&self) -> bool {
        true
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let path = PathBuf::from(args["path"].as_str().unwrap_or_default());
        let project = self.0.unregister_project(&path).await;

        let brain = self
            .0
            .ensure_brain()
            .await
            .map_err(|e| exec_err("forget_path", e))?;
        let deleted = brain
            .graph
            .delete_by_key(
                "Project",
                "path",
                &json!(path.display().to_string()),
                true,
            )
            .await
            .map_err(|e| exec_err("forget_path", e))?;

        Ok(json!({
            "unregistered": project.is_some(),
            "nodes_deleted": deleted,
        }))
    }
}

struct EmbedDirtyTool(Arc<DaemonState>);

#[async_trait]
impl Tool for EmbedDirtyTool {
    fn name(&self) -> &str {
        "embed_dirty"
    }
    fn description(&self) -> &str {
        "Embed every dirty node across registered vector indexes"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Brain
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn execute(&self, _args: Value) -> codebrain_tools::Result<Value> {
        self.0
            .embed_dirty()
            .await
            .map_err(|e| exec_err("embed_dirty", e))
    }
}

struct CreateProjectTool(Arc<DaemonState>);

#[async_trait]
impl Tool for CreateProjectTool {
    fn name(&self) -> &str {
        "create_project"
    }
    fn description(&self) -> &str {
        "Register a project root and start watching it"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Project
    }
    fn is_mutating(&self) -> bool {
        true
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "include": {"type": "array", "items": {"type": "string"}},
                "exclude": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["path"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let path = PathBuf::from(args["path"].as_str().unwrap_or_default());
        let to_globs = |key: &str| -> Vec<String> {
            args[key]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let project = self
            .0
            .register_project(path, to_globs("include"), to_globs("exclude"))
            .await
            .map_err(|e| exec_err("create_project", e))?;
        Ok(serde_json::to_value(&project).unwrap_or_default())
    }
}

struct AskAgentTool(Arc<DaemonState>);

#[async_trait]
impl Tool for AskAgentTool {
    fn name(&self) -> &str {
        "ask_agent"
    }
    fn description(&self) -> &str {
        "Run the tool-calling agent on a question"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Agent
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "conversation_id": {"type": "string"}
            },
            "required": ["question"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let Some(provider) = self.0.completion() else {
            return Err(exec_err("ask_agent", "no completion provider configured"));
        };
        let brain = self
            .0
            .ensure_brain()
            .await
            .map_err(|e| exec_err("ask_agent", e))?;

        let audit = Arc::new(AuditLog::new(&self.0.config_dir.root().join("logs")));
        let agent = AgentLoop::new(
            provider,
            Arc::clone(&self.0.tools),
            brain.context.clone(),
            audit,
            AgentLoopConfig::default(),
        );

        let task = AgentTask {
            question: args["question"].as_str().unwrap_or_default().to_string(),
            persona: self.0.personas.active().map(|p| p.persona),
            task_context: None,
            conversation_id: args["conversation_id"]
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok()),
        };

        let outcome = agent
            .run(&task, &CancellationToken::new())
            .await
            .map_err(|e| exec_err("ask_agent", e))?;
        Ok(json!({
            "answer": outcome.answer,
            "reasoning": outcome.reasoning,
            "iterations": outcome.iterations,
            "exhausted": outcome.exhausted,
            "stale": outcome.stale,
        }))
    }
}

struct ConversationStatsTool(Arc<DaemonState>);

#[async_trait]
impl Tool for ConversationStatsTool {
    fn name(&self) -> &str {
        "get_conversation_stats"
    }
    fn description(&self) -> &str {
        "Message and summary statistics for one conversation"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Debug
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"conversation_id": {"type": "string"}},
            "required": ["conversation_id"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let brain = self
            .0
            .ensure_brain()
            .await
            .map_err(|e| exec_err("get_conversation_stats", e))?;
        let id = args["conversation_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| exec_err("get_conversation_stats", "invalid conversation_id"))?;

        let conversation = brain
            .conversations
            .get_conversation(id)
            .await
            .map_err(|e| exec_err("get_conversation_stats", e))?;
        let summaries = brain
            .conversations
            .summaries(id, None)
            .await
            .map_err(|e| exec_err("get_conversation_stats", e))?;

        let mut by_level = serde_json::Map::new();
        for summary in &summaries {
            let counter = by_level
                .entry(format!("L{}", summary.level))
                .or_insert(json!(0));
            *counter = json!(counter.as_u64().unwrap_or(0) + 1);
        }

        Ok(json!({
            "conversation_id": id.to_string(),
            "message_count": conversation.message_count,
            "total_chars": conversation.total_chars,
            "status": conversation.status,
            "summaries": by_level,
        }))
    }
}

struct ExtractPromptTool(Arc<DaemonState>);

#[async_trait]
impl Tool for ExtractPromptTool {
    fn name(&self) -> &str {
        "extract_agent_prompt"
    }
    fn description(&self) -> &str {
        "Dump the exact prompt, response, and parse of one agent iteration"
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Debug
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "iteration": {"type": "integer", "minimum": 1},
                "conversation_id": {"type": "string"}
            },
            "required": ["question"]
        })
    }
    async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
        let Some(provider) = self.0.completion() else {
            return Err(exec_err(
                "extract_agent_prompt",
                "no completion provider configured",
            ));
        };
        let brain = self
            .0
            .ensure_brain()
            .await
            .map_err(|e| exec_err("extract_agent_prompt", e))?;

        let question = args["question"].as_str().unwrap_or_default().to_string();
        let iteration = args["iteration"].as_u64().unwrap_or(1);
        let conversation_id = args["conversation_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok());

        // Assemble the same enriched context the loop would see.
        let enriched = match (conversation_id, &brain.context) {
            (Some(id), Some(builder)) => builder.build(id, &question).await.ok(),
            _ => None,
        };

        let audit = Arc::new(AuditLog::new(&self.0.config_dir.root().join("logs")));
        let agent = AgentLoop::new(
            Arc::clone(&provider),
            Arc::clone(&self.0.tools),
            brain.context.clone(),
            audit,
            AgentLoopConfig::default(),
        );
        let task = AgentTask {
            question: question.clone(),
            persona: self.0.personas.active().map(|p| p.persona),
            task_context: None,
            conversation_id,
        };
        let prompt = agent.preview_prompt(&task, enriched.as_ref().map(|c| c.text.as_str()));
        let response = provider
            .complete(&prompt)
            .await
            .map_err(|e| exec_err("extract_agent_prompt", e))?;
        let parsed = codebrain_agents::parse_agent_response(&response)
            .map(|p| serde_json::to_value(&p).unwrap_or_default())
            .unwrap_or_else(|_| json!({"unparseable": true}));

        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let dir = self.0.config_dir.extract_dir(&timestamp);
        let inventory = write_extraction_dump(
            &dir,
            &codebrain_agents::extract::ExtractionInput {
                prompt: &prompt,
                response: &response,
                enriched_context: enriched.as_ref().map(|c| c.text.as_str()),
                parsed_response: &parsed,
                metadata: json!({
                    "question": question,
                    "iteration": iteration,
                    "timestamp": timestamp,
                    "model": provider.model_id(),
                }),
            },
        )
        .map_err(|e| exec_err("extract_agent_prompt", e))?;

        Ok(inventory)
    }
}
