use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use weft_core::config::OrchestratorConfig;
use weft_core::descriptor::AgentDescriptor;
use weft_core::error::{Result, WeftError};
use weft_core::event::{EngineEvent, EventBus};
use weft_core::types::{ExecutionOutcome, ExecutorBinding, NodeContext};
use weft_registry::PluginRegistry;
use weft_router::ExecutorRouter;

use crate::debate::{ConsensusDecision, DebateSession, Moderator, NormalizingModerator, Position};
use crate::planner::{ExecutionTree, PlanStep, Task, TaskAnalysis};
use crate::recovery::{FailureClass, RecoveryAction, RecoveryPolicy};

/// Node type stamped on contexts of steps dispatched to agents.
pub const AGENT_STEP: &str = "agent_step";

/// Outcome of a successful orchestration.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub task: String,
    pub analysis: TaskAnalysis,
    pub tree: ExecutionTree,
    /// Aggregated output of the root step.
    pub output: Value,
    /// Leaf step id -> agent that completed it.
    pub assignments: BTreeMap<String, String>,
    pub replans: u32,
    /// Errors that were recovered from by replanning.
    pub recovered: Vec<String>,
}

/// Bookkeeping shared by the concurrent steps of one orchestration.
struct Execution {
    id: String,
    task: Task,
    assignments: Mutex<BTreeMap<String, String>>,
    recovered: Mutex<Vec<String>>,
    replans: AtomicU32,
}

/// Plans tasks into step trees, routes steps to agents by capability,
/// replans around failures and runs debates.
pub struct AgentOrchestrator {
    registry: Arc<PluginRegistry>,
    router: Arc<ExecutorRouter>,
    events: Arc<EventBus>,
    config: OrchestratorConfig,
    moderator: Arc<dyn Moderator>,
}

impl AgentOrchestrator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        router: Arc<ExecutorRouter>,
        events: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            router,
            events,
            config,
            moderator: Arc::new(NormalizingModerator),
        }
    }

    pub fn with_moderator(mut self, moderator: Arc<dyn Moderator>) -> Self {
        self.moderator = moderator;
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<ExecutorRouter> {
        &self.router
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn register_agent(&self, agent: AgentDescriptor) -> Result<()> {
        self.registry.register_agent(agent)
    }

    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        self.registry.deregister_agent(agent_id)
    }

    pub fn plan(&self, task: &Task) -> (TaskAnalysis, ExecutionTree) {
        let analysis = TaskAnalysis::analyze(task);
        let tree = ExecutionTree::build(task, &analysis);
        (analysis, tree)
    }

    /// Pick the agent for a step.
    ///
    /// The agent must hold `capability` when one is given. Among candidates,
    /// each capability shared with the task scores 2 and a matching agent
    /// type scores 1; ties go to the lowest agent id.
    pub fn select_agent(
        &self,
        capability: Option<&str>,
        task: &Task,
        excluded: &HashSet<String>,
    ) -> Result<AgentDescriptor> {
        let snapshot = self.registry.snapshot();
        let mut best: Option<(usize, &AgentDescriptor)> = None;
        for agent in snapshot.agents() {
            if excluded.contains(&agent.agent_id) {
                continue;
            }
            if let Some(cap) = capability {
                if !agent.has_capability(cap) {
                    continue;
                }
            }
            let overlap = task
                .capabilities
                .iter()
                .filter(|c| agent.has_capability(c))
                .count();
            let type_match = task.agent_type.as_deref() == Some(agent.agent_type.as_str());
            let score = overlap * 2 + usize::from(type_match);
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, agent));
            }
        }
        best.map(|(_, agent)| agent.clone()).ok_or_else(|| {
            WeftError::InsufficientCapability(capability.unwrap_or("any").to_string())
        })
    }

    /// Plan and execute a task.
    ///
    /// Recoverable step failures are replanned onto another agent up to
    /// `max_replans` times per step; anything else aborts the whole
    /// orchestration with `FatalOrchestration` listing every error seen.
    pub async fn execute(&self, task: Task) -> Result<OrchestrationResult> {
        let (analysis, tree) = self.plan(&task);
        let exec = Execution {
            id: format!("orch-{}", uuid::Uuid::new_v4()),
            task,
            assignments: Mutex::new(BTreeMap::new()),
            recovered: Mutex::new(Vec::new()),
            replans: AtomicU32::new(0),
        };
        info!(
            orchestration = %exec.id,
            complexity = ?analysis.complexity,
            steps = tree.leaf_count(),
            "Orchestration started"
        );

        let output = match self.run_step(&exec, &tree.root).await {
            Ok(output) => output,
            Err(e) => {
                warn!(orchestration = %exec.id, error = %e, "Orchestration aborted");
                return Err(e);
            }
        };

        let replans = exec.replans.load(Ordering::SeqCst);
        info!(orchestration = %exec.id, replans, "Orchestration completed");
        Ok(OrchestrationResult {
            task: exec.task.description.clone(),
            analysis,
            tree,
            output,
            assignments: exec
                .assignments
                .into_inner()
                .unwrap_or_else(|e| e.into_inner()),
            replans,
            recovered: exec
                .recovered
                .into_inner()
                .unwrap_or_else(|e| e.into_inner()),
        })
    }

    fn run_step<'a>(&'a self, exec: &'a Execution, step: &'a PlanStep) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            if step.is_leaf() {
                return self.run_leaf(exec, step).await;
            }
            let width = if step.parallel {
                self.config.max_parallel_steps.max(1)
            } else {
                1
            };
            let children: Vec<BoxFuture<'a, (String, Result<Value>)>> = step
                .children
                .iter()
                .map(|child| {
                    let id = child.id.clone();
                    let run = self.run_step(exec, child);
                    Box::pin(async move { (id, run.await) }) as BoxFuture<'a, _>
                })
                .collect();
            let mut results = stream::iter(children).buffered(width);

            // The first failure drops the stream, which cancels siblings.
            let mut aggregate = serde_json::Map::new();
            while let Some((id, result)) = results.next().await {
                aggregate.insert(id, result?);
            }
            Ok(Value::Object(aggregate))
        })
    }

    async fn run_leaf(&self, exec: &Execution, step: &PlanStep) -> Result<Value> {
        let recovery = RecoveryPolicy::new(self.config.max_replans);
        let mut excluded = HashSet::new();
        let mut errors: Vec<String> = Vec::new();
        let mut replans = 0;

        loop {
            let agent = match self.select_agent(step.capability.as_deref(), &exec.task, &excluded) {
                Ok(agent) => agent,
                Err(e) if errors.is_empty() => return Err(e),
                Err(e) => {
                    errors.push(format!("step {}: {}", step.id, e));
                    return Err(WeftError::FatalOrchestration { errors });
                }
            };
            debug!(orchestration = %exec.id, step = %step.id, agent = %agent.agent_id, "Dispatching step");

            match self.dispatch(exec, step, &agent).await {
                Ok(output) => {
                    lock(&exec.assignments).insert(step.id.clone(), agent.agent_id.clone());
                    lock(&exec.recovered).extend(errors);
                    return Ok(output);
                }
                Err(e) => {
                    let class = FailureClass::classify(&e);
                    errors.push(format!("step {} on agent {}: {}", step.id, agent.agent_id, e));
                    match recovery.decide(class, replans) {
                        RecoveryAction::Replan => {
                            warn!(
                                orchestration = %exec.id,
                                step = %step.id,
                                agent = %agent.agent_id,
                                class = ?class,
                                error = %e,
                                "Step failed, replanning"
                            );
                            excluded.insert(agent.agent_id);
                            replans += 1;
                            exec.replans.fetch_add(1, Ordering::SeqCst);
                        }
                        RecoveryAction::Abort => {
                            return Err(WeftError::FatalOrchestration { errors });
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, exec: &Execution, step: &PlanStep, agent: &AgentDescriptor) -> Result<Value> {
        let ctx = NodeContext::new(exec.id.clone(), step.id.clone(), AGENT_STEP)
            .with_input("task", json!(exec.task.description))
            .with_input("step", json!(step.description))
            .with_input("capability", json!(step.capability))
            .with_input("agent_id", json!(agent.agent_id))
            .with_input("input", exec.task.input.clone());
        self.call_agent(agent, ctx).await
    }

    async fn call_agent(&self, agent: &AgentDescriptor, ctx: NodeContext) -> Result<Value> {
        let binding = self
            .registry
            .snapshot()
            .executor(&agent.executor)
            .map(|d| d.binding())
            .unwrap_or_else(|| ExecutorBinding::inproc(agent.executor.clone()));
        match self.router.call(&binding, ctx).await? {
            ExecutionOutcome::Completed { output } => Ok(output),
            ExecutionOutcome::Suspend { .. } => Err(WeftError::execution(
                &agent.executor,
                "agent steps cannot suspend",
            )),
        }
    }

    /// Run a bounded debate among `participants` (agent ids).
    ///
    /// Each round asks every participant for a position, given the topic and
    /// the previous round's summary. The debate stops early once the quorum
    /// agrees. A participant whose call fails abstains for that round.
    pub async fn debate(&self, topic: &str, participants: &[String], input: Value) -> Result<ConsensusDecision> {
        if participants.is_empty() {
            return Err(WeftError::validation("debate needs at least one participant"));
        }
        let snapshot = self.registry.snapshot();
        let agents = participants
            .iter()
            .map(|id| {
                snapshot
                    .agent(id)
                    .cloned()
                    .ok_or_else(|| WeftError::validation(format!("unknown agent '{}'", id)))
            })
            .collect::<Result<Vec<_>>>()?;

        let debate_id = format!("debate-{}", uuid::Uuid::new_v4());
        let moderator = self.moderator.as_ref();
        let mut session = DebateSession::new(
            topic,
            participants.to_vec(),
            self.config.max_debate_rounds,
            self.config.quorum,
        );

        while session.should_continue(moderator) {
            let round = session.next_round();
            let previous = session.rounds().last().map(|r| r.summary.clone());
            let asks = agents.iter().map(|agent| {
                let ctx = NodeContext::new(debate_id.clone(), format!("round-{}", round), AGENT_STEP)
                    .with_input("topic", json!(topic))
                    .with_input("round", json!(round))
                    .with_input("previous", json!(previous))
                    .with_input("input", input.clone());
                self.ask(agent, ctx)
            });
            let positions: Vec<Position> = join_all(asks).await.into_iter().flatten().collect();
            let summary = session.record(positions, moderator).summary.clone();
            debug!(topic = %topic, round, "Debate round recorded");
            self.events.publish(EngineEvent::DebateRound {
                topic: topic.to_string(),
                round,
                summary,
            });
        }

        let decision = session.decide(moderator);
        info!(
            topic = %topic,
            rounds = decision.rounds,
            reached = decision.consensus_reached,
            support = decision.support,
            "Debate finished"
        );
        self.events.publish(EngineEvent::ConsensusReached {
            topic: topic.to_string(),
            reached: decision.consensus_reached,
            decision: serde_json::to_value(&decision)?,
        });
        Ok(decision)
    }

    async fn ask(&self, agent: &AgentDescriptor, ctx: NodeContext) -> Option<Position> {
        match self.call_agent(agent, ctx).await {
            Ok(output) => Some(Position::new(&agent.agent_id, position_text(&output))),
            Err(e) => {
                warn!(agent = %agent.agent_id, error = %e, "Participant abstained");
                None
            }
        }
    }
}

/// A bare string, or the `position` field of an object.
fn position_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("position") {
            Some(Value::String(s)) => s.clone(),
            _ => output.to_string(),
        },
        other => other.to_string(),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::descriptor::ExecutorDescriptor;
    use weft_core::traits::Executor;
    use weft_test_utils::{MockExecutor, Step};

    struct Fixture {
        registry: Arc<PluginRegistry>,
        router: Arc<ExecutorRouter>,
        events: Arc<EventBus>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(PluginRegistry::new()),
                router: Arc::new(ExecutorRouter::default()),
                events: Arc::new(EventBus::default()),
            }
        }

        async fn agent(&self, id: &str, agent_type: &str, caps: &[&str], exec: MockExecutor) {
            let exec = Arc::new(exec);
            self.registry
                .register_executor(ExecutorDescriptor::inproc(exec.id()))
                .unwrap();
            self.registry
                .register_agent(AgentDescriptor {
                    agent_id: id.into(),
                    agent_type: agent_type.into(),
                    name: None,
                    capabilities: caps.iter().map(|c| c.to_string()).collect(),
                    executor: exec.id().into(),
                })
                .unwrap();
            self.router.register_executor(exec).await.unwrap();
        }

        fn orchestrator(&self, config: OrchestratorConfig) -> AgentOrchestrator {
            AgentOrchestrator::new(
                self.registry.clone(),
                self.router.clone(),
                self.events.clone(),
                config,
            )
        }
    }

    #[tokio::test]
    async fn selection_scores_overlap_then_type_then_id() {
        let f = Fixture::new();
        f.agent("b-writer", "writer", &["write"], MockExecutor::new("e1")).await;
        f.agent("a-writer", "writer", &["write"], MockExecutor::new("e2")).await;
        f.agent("c-both", "research", &["write", "search"], MockExecutor::new("e3")).await;
        let orch = f.orchestrator(OrchestratorConfig::default());
        let none = HashSet::new();

        let task = Task::new("t").with_capability("write");
        assert_eq!(orch.select_agent(Some("write"), &task, &none).unwrap().agent_id, "a-writer");

        let task = Task::new("t").with_capability("write").with_capability("search");
        assert_eq!(orch.select_agent(Some("write"), &task, &none).unwrap().agent_id, "c-both");

        let task = Task::new("t").with_capability("write").with_agent_type("research");
        assert_eq!(orch.select_agent(Some("write"), &task, &none).unwrap().agent_id, "c-both");

        let err = orch.select_agent(Some("translate"), &task, &none).unwrap_err();
        assert!(matches!(err, WeftError::InsufficientCapability(ref c) if c == "translate"));
    }

    #[tokio::test]
    async fn leaves_route_to_capable_agents() {
        let f = Fixture::new();
        f.agent("alpha", "research", &["search"], MockExecutor::returning("ex-a", json!("found"))).await;
        f.agent("beta", "writer", &["write"], MockExecutor::returning("ex-b", json!("draft"))).await;
        let orch = f.orchestrator(OrchestratorConfig::default());

        let result = orch
            .execute(Task::new("brief").with_capability("search").with_capability("write"))
            .await
            .unwrap();
        assert_eq!(result.output, json!({"step-1": "found", "step-2": "draft"}));
        assert_eq!(result.assignments["step-1"], "alpha");
        assert_eq!(result.assignments["step-2"], "beta");
        assert_eq!(result.replans, 0);
    }

    #[tokio::test]
    async fn failed_step_is_replanned_onto_another_agent() {
        let f = Fixture::new();
        f.agent(
            "alpha",
            "research",
            &["search"],
            MockExecutor::new("ex-a").then(Step::Fail("rate limited".into())),
        )
        .await;
        f.agent("gamma", "research", &["search"], MockExecutor::returning("ex-g", json!("ok"))).await;
        let orch = f.orchestrator(OrchestratorConfig::default());

        let result = orch.execute(Task::new("find").with_capability("search")).await.unwrap();
        assert_eq!(result.assignments["step-1"], "gamma");
        assert_eq!(result.replans, 1);
        assert_eq!(result.recovered.len(), 1);
        assert!(result.recovered[0].contains("rate limited"));
    }

    #[tokio::test]
    async fn exhausted_replans_abort_with_all_errors() {
        let f = Fixture::new();
        for (id, ex) in [("a1", "ex-1"), ("a2", "ex-2"), ("a3", "ex-3")] {
            f.agent(id, "research", &["search"], MockExecutor::new(ex).then(Step::Fail("boom".into())))
                .await;
        }
        let config = OrchestratorConfig {
            max_replans: 1,
            ..Default::default()
        };
        let orch = f.orchestrator(config);

        match orch.execute(Task::new("find").with_capability("search")).await {
            Err(WeftError::FatalOrchestration { errors }) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("a1"));
                assert!(errors[1].contains("a2"));
            }
            other => panic!("expected fatal orchestration, got {:?}", other.map(|r| r.output)),
        }
    }

    #[tokio::test]
    async fn missing_capability_is_reported() {
        let f = Fixture::new();
        f.agent("alpha", "research", &["search"], MockExecutor::new("ex-a")).await;
        let orch = f.orchestrator(OrchestratorConfig::default());
        let err = orch
            .execute(Task::new("x").with_capability("translate"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::InsufficientCapability(_)));
    }

    #[tokio::test]
    async fn agreeing_debate_exits_after_one_round() {
        let f = Fixture::new();
        f.agent("a", "critic", &[], MockExecutor::returning("ex-a", json!("Approve"))).await;
        f.agent("b", "critic", &[], MockExecutor::returning("ex-b", json!({"position": "approve"})))
            .await;
        f.agent("c", "critic", &[], MockExecutor::returning("ex-c", json!(" APPROVE "))).await;
        let orch = f.orchestrator(OrchestratorConfig::default());
        let mut rx = f.events.subscribe();

        let ids: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let decision = orch.debate("release", &ids, Value::Null).await.unwrap();
        assert!(decision.consensus_reached);
        assert!(decision.dissenting.is_empty());
        assert_eq!(decision.rounds, 1);

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::DebateRound { round: 1, .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::ConsensusReached { reached: true, .. }
        ));
    }

    #[tokio::test]
    async fn split_debate_uses_every_round() {
        let f = Fixture::new();
        f.agent("a", "critic", &[], MockExecutor::returning("ex-a", json!("yes"))).await;
        f.agent("b", "critic", &[], MockExecutor::returning("ex-b", json!("no"))).await;
        f.agent("c", "critic", &[], MockExecutor::returning("ex-c", json!("maybe"))).await;
        let orch = f.orchestrator(OrchestratorConfig::default());

        let ids: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let decision = orch.debate("release", &ids, Value::Null).await.unwrap();
        assert!(!decision.consensus_reached);
        assert_eq!(decision.rounds, 3);
        assert_eq!(decision.dissenting, ids);
    }
}
