//! The iterative tool-calling loop

use serde_json::{json, Value};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::error::{AgentError, Result};
use crate::provider::CompletionModel;
use crate::xml::{parse_agent_response, response_schema_block, ParsedItem};
use codebrain_context::ContextBuilder;
use codebrain_tools::{BatchToolCall, ToolRegistry};

/// Loop tuning
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Iteration budget before the loop gives up
    pub max_iterations: u32,
    /// Sub-agent mode requires `final_answer`; default mode uses `answer`
    pub sub_agent: bool,
    /// Base system prompt
    pub base_prompt: String,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            sub_agent: false,
            base_prompt: "You are a code-aware assistant with access to a knowledge graph \
                          of the user's projects. Use the available tools to ground every \
                          answer in the actual code."
                .to_string(),
        }
    }
}

impl AgentLoopConfig {
    fn terminal_field(&self) -> &'static str {
        if self.sub_agent {
            "final_answer"
        } else {
            "answer"
        }
    }
}

/// One task handed to the loop
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub question: String,
    /// Persona prompt text, passed as a labeled input field
    pub persona: Option<String>,
    /// Extra task-scoped context appended to the system prompt
    pub task_context: Option<String>,
    /// Conversation to pull enriched context from
    pub conversation_id: Option<Uuid>,
}

impl AgentTask {
    /// A bare question
    #[must_use]
    pub fn question(text: impl Into<String>) -> Self {
        Self {
            question: text.into(),
            persona: None,
            task_context: None,
            conversation_id: None,
        }
    }
}

/// What one run produced
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Terminal answer, or the last output if the model stopped calling
    /// tools without one
    pub answer: Option<String>,
    pub reasoning: Option<String>,
    pub iterations: u32,
    /// Whether the loop hit its iteration budget
    pub exhausted: bool,
    /// True if any read in the run was served stale
    pub stale: bool,
}

/// The agent executor
pub struct AgentLoop {
    provider: Arc<dyn CompletionModel>,
    tools: Arc<ToolRegistry>,
    context_builder: Option<Arc<ContextBuilder>>,
    audit: Arc<AuditLog>,
    config: AgentLoopConfig,
}

impl AgentLoop {
    /// Create a loop
    #[must_use]
    pub fn new(
        provider: Arc<dyn CompletionModel>,
        tools: Arc<ToolRegistry>,
        context_builder: Option<Arc<ContextBuilder>>,
        audit: Arc<AuditLog>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            context_builder,
            audit,
            config,
        }
    }

    /// Run the loop to completion or cancellation
    ///
    /// Cancellation is honored between iterations; an in-flight tool call
    /// finishes but its results are discarded.
    ///
    /// # Errors
    ///
    /// Provider failures and cancellation propagate; tool failures do
    /// not; they become tool results the model sees next iteration.
    pub async fn run(&self, task: &AgentTask, cancel: &CancellationToken) -> Result<AgentOutcome> {
        let enriched = self.build_enriched_context(task).await;
        let mut stale = enriched.as_ref().is_some_and(|c| c.stale);
        let mut tool_context: Vec<Value> = Vec::new();
        let mut last_item: Option<ParsedItem> = None;

        self.audit.record(
            "run_start",
            None,
            json!({"question": task.question, "model": self.provider.model_id()}),
        );

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                self.audit
                    .record("cancelled", Some(iteration), json!({}));
                return Err(AgentError::Cancelled);
            }

            let prompt = self.build_prompt(
                task,
                enriched.as_ref().map(|c| c.text.as_str()),
                &tool_context,
            );
            self.audit.record(
                "iteration_start",
                Some(iteration),
                json!({"prompt_chars": prompt.chars().count()}),
            );

            let response = self.provider.complete(&prompt).await?;
            self.audit.record(
                "llm_response",
                Some(iteration),
                json!({"response_chars": response.chars().count()}),
            );

            let parsed = match parse_agent_response(&response) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // An unparseable response becomes the answer verbatim
                    // rather than crashing the turn.
                    warn!(error = %e, "Unparseable response; returning raw text");
                    self.audit
                        .record("parse_failure", Some(iteration), json!({}));
                    return Ok(AgentOutcome {
                        answer: Some(response),
                        reasoning: None,
                        iterations: iteration,
                        exhausted: false,
                        stale,
                    });
                }
            };

            let Some(item) = parsed.first().cloned() else {
                return Ok(AgentOutcome {
                    answer: None,
                    reasoning: None,
                    iterations: iteration,
                    exhausted: false,
                    stale,
                });
            };

            // Terminal output ends the loop regardless of tool calls.
            if let Some(answer) = item.field(self.config.terminal_field()) {
                self.audit.record(
                    "run_complete",
                    Some(iteration),
                    json!({"answer_chars": answer.chars().count()}),
                );
                info!(iterations = iteration, "Agent run complete");
                return Ok(AgentOutcome {
                    answer: Some(answer.to_string()),
                    reasoning: item.reasoning.clone(),
                    iterations: iteration,
                    exhausted: false,
                    stale,
                });
            }

            // Drop calls to tools we do not have.
            let (known, unknown): (Vec<_>, Vec<_>) = item
                .tool_calls
                .iter()
                .partition(|call| self.tools.contains(&call.name));
            for call in unknown {
                warn!(tool = %call.name, "Model requested unknown tool; dropped");
            }

            if known.is_empty() {
                // No terminal field and nothing to do: return the output
                // as-is.
                let answer = item
                    .output
                    .values()
                    .next()
                    .cloned()
                    .or_else(|| item.reasoning.clone());
                self.audit
                    .record("run_complete", Some(iteration), json!({"implicit": true}));
                return Ok(AgentOutcome {
                    answer,
                    reasoning: item.reasoning.clone(),
                    iterations: iteration,
                    exhausted: false,
                    stale,
                });
            }

            let batch: Vec<BatchToolCall> = known
                .iter()
                .enumerate()
                .map(|(index, call)| BatchToolCall {
                    id: u32::try_from(index).unwrap_or(0),
                    name: call.name.clone(),
                    args: call.args(),
                })
                .collect();
            let outcomes = self.tools.execute_batch(batch).await;

            if cancel.is_cancelled() {
                // Out of contract to cancel mid-call; results of finished
                // calls are discarded instead.
                self.audit.record("cancelled", Some(iteration), json!({}));
                return Err(AgentError::Cancelled);
            }

            for outcome in &outcomes {
                stale = stale || outcome.stale;
                self.audit.record(
                    "tool_result",
                    Some(iteration),
                    json!({
                        "tool": outcome.name,
                        "success": outcome.success,
                        "duration_ms": outcome.duration_ms,
                    }),
                );
                tool_context.push(json!({
                    "tool": outcome.name,
                    "success": outcome.success,
                    "result": outcome.result,
                }));
            }

            last_item = Some(item);
            debug!(iteration, tools = outcomes.len(), "Iteration complete");
        }

        self.audit.record("run_exhausted", None, json!({}));
        Ok(AgentOutcome {
            answer: last_item
                .as_ref()
                .and_then(|item| item.output.values().next().cloned()),
            reasoning: last_item.and_then(|item| item.reasoning),
            iterations: self.config.max_iterations,
            exhausted: true,
            stale,
        })
    }

    async fn build_enriched_context(
        &self,
        task: &AgentTask,
    ) -> Option<codebrain_context::EnrichedContext> {
        let builder = self.context_builder.as_ref()?;
        let conversation_id = task.conversation_id?;
        match builder.build(conversation_id, &task.question).await {
            Ok(context) => Some(context),
            Err(e) => {
                warn!(error = %e, "Context assembly failed; running without it");
                None
            }
        }
    }

    /// The exact prompt the first iteration would send (debug extraction)
    #[must_use]
    pub fn preview_prompt(&self, task: &AgentTask, enriched: Option<&str>) -> String {
        self.build_prompt(task, enriched, &[])
    }

    /// Assemble the full prompt for one iteration
    fn build_prompt(
        &self,
        task: &AgentTask,
        enriched: Option<&str>,
        tool_context: &[Value],
    ) -> String {
        let mut prompt = self.config.base_prompt.clone();
        if let Some(context) = &task.task_context {
            let _ = write!(prompt, "\n\n{context}");
        }
        if let Some(context) = enriched {
            let _ = write!(prompt, "\n\n{context}");
        }

        let definitions = serde_json::to_string_pretty(&self.tools.definitions())
            .unwrap_or_else(|_| "[]".to_string());
        let _ = write!(prompt, "\n\n## Available Tools\n{definitions}");

        let _ = write!(prompt, "\n\n## Task\n{}", task.question);
        if let Some(persona) = &task.persona {
            let _ = write!(prompt, "\n\n## Persona\n{persona}");
        }

        if !tool_context.is_empty() {
            let results = serde_json::to_string_pretty(&tool_context)
                .unwrap_or_else(|_| "[]".to_string());
            let _ = write!(prompt, "\n\n## Tool Results So Far\n{results}");
        }

        let _ = write!(
            prompt,
            "\n\n## Output Format\n{}",
            response_schema_block(self.config.terminal_field())
        );
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedCompletion;
    use async_trait::async_trait;
    use codebrain_core::LockRegistry;
    use codebrain_tools::{Tool, ToolCategory};
    use parking_lot::Mutex;

    struct CountingSearch {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for CountingSearch {
        fn name(&self) -> &str {
            "brain_search"
        }
        fn description(&self) -> &str {
            "test search"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Brain
        }
        async fn execute(&self, args: Value) -> codebrain_tools::Result<Value> {
            self.calls
                .lock()
                .push(args["query"].as_str().unwrap_or_default().to_string());
            Ok(json!({"hits": ["src/foo.ts"]}))
        }
    }

    fn agent_with(
        responses: Vec<&str>,
    ) -> (AgentLoop, Arc<Mutex<Vec<String>>>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let tools = Arc::new(ToolRegistry::new(Arc::new(LockRegistry::new())));
        let calls = Arc::new(Mutex::new(Vec::new()));
        tools.register(Arc::new(CountingSearch {
            calls: Arc::clone(&calls),
        }));

        let agent = AgentLoop::new(
            Arc::new(ScriptedCompletion::new(responses)),
            tools,
            None,
            Arc::new(AuditLog::new(tmp.path())),
            AgentLoopConfig::default(),
        );
        (agent, calls, tmp)
    }

    #[tokio::test]
    async fn test_direct_answer_terminates_first_iteration() {
        let (agent, calls, _tmp) = agent_with(vec![
            "<items><item id=\"1\"><answer>done</answer></item></items>",
        ]);

        let outcome = agent
            .run(&AgentTask::question("q"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("done"));
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.exhausted);
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tool_call_then_answer() {
        let (agent, calls, _tmp) = agent_with(vec![
            "<items><item id=\"1\"><reasoning>need code</reasoning>\
             <tool_calls><tool_call name=\"brain_search\">{\"query\":\"class Foo\"}</tool_call>\
             </tool_calls></item></items>",
            "<items><item id=\"1\"><answer>Foo is in src/foo.ts</answer></item></items>",
        ]);

        let outcome = agent
            .run(&AgentTask::question("where is Foo?"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 2);
        assert_eq!(calls.lock().clone(), vec!["class Foo".to_string()]);
        assert_eq!(outcome.answer.as_deref(), Some("Foo is in src/foo.ts"));
    }

    #[tokio::test]
    async fn test_second_prompt_carries_tool_results() {
        let tmp = tempfile::tempdir().unwrap();
        let tools = Arc::new(ToolRegistry::new(Arc::new(LockRegistry::new())));
        tools.register(Arc::new(CountingSearch {
            calls: Arc::new(Mutex::new(Vec::new())),
        }));
        let provider = Arc::new(ScriptedCompletion::new(vec![
            "<items><item id=\"1\"><tool_calls>\
             <tool_call name=\"brain_search\">{\"query\":\"x\"}</tool_call>\
             </tool_calls></item></items>",
            "<items><item id=\"1\"><answer>ok</answer></item></items>",
        ]));
        let agent = AgentLoop::new(
            Arc::clone(&provider) as Arc<dyn CompletionModel>,
            tools,
            None,
            Arc::new(AuditLog::new(tmp.path())),
            AgentLoopConfig::default(),
        );

        agent
            .run(&AgentTask::question("q"), &CancellationToken::new())
            .await
            .unwrap();

        let prompts = provider.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Tool Results So Far"));
        assert!(prompts[1].contains("Tool Results So Far"));
        assert!(prompts[1].contains("src/foo.ts"));
    }

    #[tokio::test]
    async fn test_unknown_tools_filtered_and_output_returned() {
        let (agent, calls, _tmp) = agent_with(vec![
            "<items><item id=\"1\"><summary>partial notes</summary>\
             <tool_calls><tool_call name=\"no_such_tool\">{}</tool_call></tool_calls>\
             </item></items>",
        ]);

        let outcome = agent
            .run(&AgentTask::question("q"), &CancellationToken::new())
            .await
            .unwrap();
        // Unknown tool dropped, no terminal field: output comes back as-is.
        assert_eq!(outcome.answer.as_deref(), Some("partial notes"));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_iteration_budget() {
        let loop_response = "<items><item id=\"1\"><tool_calls>\
             <tool_call name=\"brain_search\">{\"query\":\"again\"}</tool_call>\
             </tool_calls></item></items>";
        let (agent, calls, _tmp) = agent_with(vec![loop_response; 10]);

        let outcome = agent
            .run(&AgentTask::question("q"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.exhausted);
        assert_eq!(outcome.iterations, 10);
        assert_eq!(calls.lock().len(), 10);
    }

    #[tokio::test]
    async fn test_cancellation_between_iterations() {
        let (agent, _calls, _tmp) = agent_with(vec![
            "<items><item id=\"1\"><answer>never seen</answer></item></items>",
        ]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent
            .run(&AgentTask::question("q"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_unparseable_response_returned_raw() {
        let (agent, _calls, _tmp) = agent_with(vec!["plain prose, no xml"]);
        let outcome = agent
            .run(&AgentTask::question("q"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("plain prose, no xml"));
    }

    #[tokio::test]
    async fn test_persona_lands_in_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let tools = Arc::new(ToolRegistry::new(Arc::new(LockRegistry::new())));
        let provider = Arc::new(ScriptedCompletion::new(vec![
            "<items><item id=\"1\"><answer>aye</answer></item></items>",
        ]));
        let agent = AgentLoop::new(
            Arc::clone(&provider) as Arc<dyn CompletionModel>,
            tools,
            None,
            Arc::new(AuditLog::new(tmp.path())),
            AgentLoopConfig::default(),
        );

        let task = AgentTask {
            question: "q".into(),
            persona: Some("Answer like a pirate".into()),
            task_context: None,
            conversation_id: None,
        };
        agent.run(&task, &CancellationToken::new()).await.unwrap();

        let prompts = provider.prompts();
        assert!(prompts[0].contains("## Persona"));
        assert!(prompts[0].contains("Answer like a pirate"));
        assert!(prompts[0].contains("## Output Format"));
    }
}
