//! Staged execution of batched tool calls
//!
//! When one LLM response carries several tool calls, ordering matters:
//! a parallel `brain_search` must not race a `write_file` emitted in the
//! same response. Calls therefore run in three stages: project
//! management sequentially, file modification sequentially, everything
//! else in parallel, each stage completing before the next starts.

use futures::future::join_all;
use serde_json::Value;
use tracing::debug;

use crate::registry::{ToolCategory, ToolRegistry};

/// One call from a parsed LLM response
#[derive(Debug, Clone)]
pub struct BatchToolCall {
    /// Correlation id from the response (`<item id=…>`)
    pub id: u32,
    pub name: String,
    pub args: Value,
}

/// Outcome of one batched call, in input order
#[derive(Debug, Clone)]
pub struct BatchToolOutcome {
    pub id: u32,
    pub name: String,
    pub success: bool,
    /// Tool result on success, `{success: false, error}` shape on failure
    pub result: Value,
    pub duration_ms: u64,
    pub stale: bool,
}

impl ToolRegistry {
    /// Execute a batch of calls in staged order, returning outcomes in
    /// the original input order.
    ///
    /// A failing call becomes a failed outcome; it never aborts the rest
    /// of the batch.
    pub async fn execute_batch(&self, calls: Vec<BatchToolCall>) -> Vec<BatchToolOutcome> {
        let mut project_stage = Vec::new();
        let mut file_stage = Vec::new();
        let mut parallel_stage = Vec::new();

        for (position, call) in calls.into_iter().enumerate() {
            match self.category_of(&call.name) {
                Some(ToolCategory::Project) => project_stage.push((position, call)),
                Some(ToolCategory::File) if self.is_mutating(&call.name) => {
                    file_stage.push((position, call));
                }
                _ => parallel_stage.push((position, call)),
            }
        }
        debug!(
            project = project_stage.len(),
            file = file_stage.len(),
            parallel = parallel_stage.len(),
            "Executing staged batch"
        );

        let mut outcomes: Vec<(usize, BatchToolOutcome)> = Vec::new();

        for (position, call) in project_stage {
            let outcome = self.run_one(call).await;
            outcomes.push((position, outcome));
        }
        for (position, call) in file_stage {
            let outcome = self.run_one(call).await;
            outcomes.push((position, outcome));
        }

        let parallel_results = join_all(
            parallel_stage
                .into_iter()
                .map(|(position, call)| async move { (position, self.run_one(call).await) }),
        )
        .await;
        outcomes.extend(parallel_results);

        outcomes.sort_by_key(|(position, _)| *position);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    async fn run_one(&self, call: BatchToolCall) -> BatchToolOutcome {
        match self.invoke(&call.name, call.args).await {
            Ok(outcome) => BatchToolOutcome {
                id: call.id,
                name: call.name,
                success: true,
                result: outcome.result,
                duration_ms: outcome.duration_ms,
                stale: outcome.stale,
            },
            Err(e) => BatchToolOutcome {
                id: call.id,
                name: call.name,
                success: false,
                result: serde_json::json!({"success": false, "error": e.to_string()}),
                duration_ms: 0,
                stale: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Tool;
    use async_trait::async_trait;
    use codebrain_core::LockRegistry;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    /// Records execution order by name
    struct OrderedTool {
        name: String,
        category: ToolCategory,
        mutating: bool,
        order: Arc<Mutex<Vec<String>>>,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for OrderedTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "test"
        }
        fn category(&self) -> ToolCategory {
            self.category
        }
        fn is_mutating(&self) -> bool {
            self.mutating
        }
        async fn execute(&self, _args: Value) -> crate::error::Result<Value> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            self.order.lock().push(self.name.clone());
            Ok(json!({"tool": self.name}))
        }
    }

    fn registry_with_order() -> (ToolRegistry, Arc<Mutex<Vec<String>>>) {
        let registry = ToolRegistry::new(Arc::new(LockRegistry::new()));
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, category, mutating, delay) in [
            ("create_project", ToolCategory::Project, true, 20u64),
            ("write_file", ToolCategory::File, true, 20),
            ("read_file", ToolCategory::File, false, 0),
            ("brain_search", ToolCategory::Brain, false, 0),
        ] {
            registry.register(Arc::new(OrderedTool {
                name: name.to_string(),
                category,
                mutating,
                order: Arc::clone(&order),
                delay_ms: delay,
            }));
        }
        (registry, order)
    }

    #[tokio::test]
    async fn test_write_completes_before_parallel_read() {
        let (registry, order) = registry_with_order();

        let outcomes = registry
            .execute_batch(vec![
                BatchToolCall {
                    id: 1,
                    name: "write_file".into(),
                    args: json!({}),
                },
                BatchToolCall {
                    id: 2,
                    name: "brain_search".into(),
                    args: json!({}),
                },
            ])
            .await;

        // Despite the write's delay, it must finish before the search runs.
        let observed = order.lock().clone();
        assert_eq!(observed, vec!["write_file", "brain_search"]);
        // Outcomes come back in input order.
        assert_eq!(outcomes[0].name, "write_file");
        assert_eq!(outcomes[1].name, "brain_search");
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[tokio::test]
    async fn test_project_stage_runs_first() {
        let (registry, order) = registry_with_order();

        registry
            .execute_batch(vec![
                BatchToolCall {
                    id: 1,
                    name: "brain_search".into(),
                    args: json!({}),
                },
                BatchToolCall {
                    id: 2,
                    name: "create_project".into(),
                    args: json!({}),
                },
                BatchToolCall {
                    id: 3,
                    name: "write_file".into(),
                    args: json!({}),
                },
            ])
            .await;

        let observed = order.lock().clone();
        assert_eq!(
            observed,
            vec!["create_project", "write_file", "brain_search"]
        );
    }

    #[tokio::test]
    async fn test_read_only_file_tool_goes_parallel() {
        let (registry, _order) = registry_with_order();
        let outcomes = registry
            .execute_batch(vec![
                BatchToolCall {
                    id: 1,
                    name: "read_file".into(),
                    args: json!({}),
                },
                BatchToolCall {
                    id: 2,
                    name: "missing_tool".into(),
                    args: json!({}),
                },
            ])
            .await;

        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].result["success"], json!(false));
    }
}
