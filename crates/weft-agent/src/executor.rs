use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::descriptor::NodeTypeDescriptor;
use weft_core::error::{Result, WeftError};
use weft_core::traits::Executor;
use weft_core::types::{ExecutionOutcome, NodeContext};

use crate::orchestrator::AgentOrchestrator;
use crate::planner::Task;

/// Node type (and executor id) served by [`AgentExecutor`].
pub const AGENT: &str = "agent";

/// Exposes the orchestrator as an INPROC executor so workflow nodes of type
/// `agent` can plan tasks or run debates.
///
/// Node config:
/// - `mode`: `task` (default) or `debate`
/// - `task` / `topic`: text, also accepted as an input of the same name
/// - `capabilities`, `agent_type`: task routing hints
/// - `participants`: agent ids for a debate
pub struct AgentExecutor {
    // The router owns this executor and the orchestrator owns the router.
    orchestrator: Weak<AgentOrchestrator>,
}

impl AgentExecutor {
    pub fn new(orchestrator: &Arc<AgentOrchestrator>) -> Self {
        Self {
            orchestrator: Arc::downgrade(orchestrator),
        }
    }

    /// Register the executor with the orchestrator's router and publish the
    /// `agent` node type in its registry.
    pub async fn install(orchestrator: &Arc<AgentOrchestrator>) -> Result<()> {
        let executor = Arc::new(Self::new(orchestrator));
        orchestrator.registry().register_executor(executor.descriptor())?;
        let mut node_type = NodeTypeDescriptor::builtin(AGENT, false);
        node_type.label = Some("Agent".to_string());
        node_type.default_executor = Some(AGENT.to_string());
        orchestrator.registry().register_node_type(node_type)?;
        orchestrator.router().register_executor(executor).await
    }

    async fn run(&self, ctx: NodeContext) -> Result<Value> {
        let orchestrator = self
            .orchestrator
            .upgrade()
            .ok_or_else(|| WeftError::unavailable(AGENT, "orchestrator has shut down"))?;

        match setting(&ctx, "mode").as_ref().and_then(Value::as_str).unwrap_or("task") {
            "task" => {
                let description = text(&ctx, "task")?;
                let mut task = Task::new(description);
                task.capabilities = strings(setting(&ctx, "capabilities"));
                task.agent_type = setting(&ctx, "agent_type")
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(str::to_string);
                task.input = ctx.input("input").cloned().unwrap_or_else(|| ctx.inputs_value());
                let result = orchestrator.execute(task).await?;
                Ok(json!({
                    "output": result.output,
                    "assignments": result.assignments,
                    "replans": result.replans,
                }))
            }
            "debate" => {
                let topic = text(&ctx, "topic")?;
                let participants = strings(setting(&ctx, "participants"));
                let decision = orchestrator
                    .debate(&topic, &participants, ctx.inputs_value())
                    .await?;
                Ok(serde_json::to_value(decision)?)
            }
            other => Err(WeftError::validation(format!("unknown agent mode '{}'", other))),
        }
    }
}

impl Executor for AgentExecutor {
    fn id(&self) -> &str {
        AGENT
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move { self.run(ctx).await.map(ExecutionOutcome::completed) })
    }
}

/// Input wins over config.
fn setting(ctx: &NodeContext, key: &str) -> Option<Value> {
    ctx.input(key).or_else(|| ctx.config.get(key)).cloned()
}

fn text(ctx: &NodeContext, key: &str) -> Result<String> {
    match setting(ctx, key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(WeftError::binding(
            &ctx.node_id,
            format!("agent node needs a '{}' string", key),
        )),
    }
}

fn strings(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s],
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::config::OrchestratorConfig;
    use weft_core::descriptor::{AgentDescriptor, ExecutorDescriptor};
    use weft_core::event::EventBus;
    use weft_core::types::ExecutorBinding;
    use weft_registry::PluginRegistry;
    use weft_router::ExecutorRouter;
    use weft_test_utils::MockExecutor;

    async fn orchestrator() -> Arc<AgentOrchestrator> {
        let registry = Arc::new(PluginRegistry::new());
        let router = Arc::new(ExecutorRouter::default());
        let mock = Arc::new(MockExecutor::returning("ex-search", json!("hits")));
        registry
            .register_executor(ExecutorDescriptor::inproc("ex-search"))
            .unwrap();
        registry
            .register_agent(AgentDescriptor {
                agent_id: "searcher".into(),
                agent_type: "research".into(),
                name: None,
                capabilities: vec!["search".into()],
                executor: "ex-search".into(),
            })
            .unwrap();
        router.register_executor(mock).await.unwrap();
        let orch = Arc::new(AgentOrchestrator::new(
            registry,
            router,
            Arc::new(EventBus::default()),
            OrchestratorConfig::default(),
        ));
        AgentExecutor::install(&orch).await.unwrap();
        orch
    }

    #[tokio::test]
    async fn agent_node_runs_through_router() {
        let orch = orchestrator().await;
        let binding = orch.registry().resolve_binding(AGENT, None).unwrap();
        assert_eq!(binding, ExecutorBinding::inproc(AGENT));

        let mut ctx = NodeContext::new("r1", "n1", AGENT).with_input("task", json!("look it up"));
        ctx.config.insert("capabilities".into(), json!(["search"]));
        let outcome = orch.router().call(&binding, ctx).await.unwrap();
        match outcome {
            ExecutionOutcome::Completed { output } => {
                assert_eq!(output["output"], json!({"step-1": "hits"}));
                assert_eq!(output["assignments"]["step-1"], "searcher");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropped_orchestrator_is_unavailable() {
        let orch = orchestrator().await;
        let exec = AgentExecutor::new(&orch);
        drop(orch);
        let err = exec
            .execute(NodeContext::new("r", "n", AGENT).with_input("task", json!("x")))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
