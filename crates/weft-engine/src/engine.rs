use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use weft_core::config::{EngineConfig, SchedulerConfig};
use weft_core::descriptor::NodeTypeDescriptor;
use weft_core::error::{Result, WeftError};
use weft_core::event::{EngineEvent, EventBus};
use weft_core::expression::{Expression, ExpressionCache};
use weft_core::traits::{AuditSink, CheckpointStore, PolicySource};
use weft_core::types::{ExecutionToken, NodeStatus, RunId, RunStatus, ValueMap};
use weft_registry::PluginRegistry;
use weft_router::{ExecutorRouter, RetryPolicy};

use crate::builtin;
use crate::checkpoint::MemoryCheckpointStore;
use crate::graph::{GraphModel, WorkflowGraph};
use crate::guardrail::GuardrailGate;
use crate::scheduler::{Scheduler, SchedulerMsg};
use crate::state::NodeExecutionState;
use crate::token::TokenIssuer;

/// Partial output of a STREAM node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeChunk {
    pub node_id: String,
    pub chunk: Value,
}

/// A node parked until an external resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedNode {
    pub node_id: String,
    pub state_tag: String,
    pub awaiting: Value,
    /// Present this token to `resume`. It is single use.
    pub token: ExecutionToken,
}

/// Final state of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub nodes: BTreeMap<String, NodeExecutionState>,
    /// Unhandled node failures, as `node: error`.
    pub errors: Vec<String>,
    pub sinks: Vec<String>,
}

impl RunReport {
    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionState> {
        self.nodes.get(node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.nodes.get(node_id).and_then(|n| n.output.as_ref())
    }

    /// Output of the completed sink node, or an object keyed by sink id
    /// when several sinks completed.
    pub fn result(&self) -> Value {
        let done: Vec<(&String, &Value)> = self
            .sinks
            .iter()
            .filter_map(|id| {
                self.nodes
                    .get(id)
                    .filter(|n| n.status == NodeStatus::Completed)
                    .and_then(|n| n.output.as_ref())
                    .map(|out| (id, out))
            })
            .collect();
        match done.as_slice() {
            [] => Value::Null,
            [(_, out)] => (*out).clone(),
            many => Value::Object(
                many.iter()
                    .map(|(id, out)| ((*id).clone(), (*out).clone()))
                    .collect(),
            ),
        }
    }
}

/// State of one run shared between its scheduler, workers and handles.
pub(crate) struct RunShared {
    pub(crate) run_id: RunId,
    pub(crate) graph_id: String,
    pub(crate) states: HashMap<String, Arc<tokio::sync::Mutex<NodeExecutionState>>>,
    pub(crate) suspended: Mutex<HashMap<String, SuspendedNode>>,
    pub(crate) chunks: broadcast::Sender<NodeChunk>,
    pub(crate) status: watch::Sender<RunStatus>,
    pub(crate) report: watch::Sender<Option<RunReport>>,
    pub(crate) cancel: CancellationToken,
    /// Bounds concurrent executor dispatches within the run.
    pub(crate) permits: Arc<Semaphore>,
}

impl RunShared {
    pub(crate) fn state(&self, node_id: &str) -> Result<Arc<tokio::sync::Mutex<NodeExecutionState>>> {
        self.states
            .get(node_id)
            .cloned()
            .ok_or_else(|| WeftError::validation(format!("unknown node '{}'", node_id)))
    }

    pub(crate) async fn snapshot(&self) -> BTreeMap<String, NodeExecutionState> {
        let mut nodes = BTreeMap::new();
        for (id, state) in &self.states {
            nodes.insert(id.clone(), state.lock().await.clone());
        }
        nodes
    }

    pub(crate) fn parked(&self) -> Vec<SuspendedNode> {
        let mut parked: Vec<SuspendedNode> = self
            .suspended
            .lock()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        parked.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        parked
    }
}

pub(crate) struct EngineInner {
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) router: Arc<ExecutorRouter>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) gate: GuardrailGate,
    pub(crate) exprs: Arc<ExpressionCache>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) audit: Option<Arc<dyn AuditSink>>,
    pub(crate) tokens: TokenIssuer,
    pub(crate) retry: RetryPolicy,
    pub(crate) config: SchedulerConfig,
    graphs: RwLock<HashMap<String, Arc<GraphModel>>>,
    runs: Mutex<HashMap<String, mpsc::Sender<SchedulerMsg>>>,
}

impl EngineInner {
    pub(crate) fn emit(&self, event: EngineEvent) {
        if let Some(sink) = &self.audit {
            let payload = serde_json::to_value(&event).unwrap_or_default();
            sink.emit(event.event_type(), payload);
        }
        self.events.publish(event);
    }

    pub(crate) fn descriptor(&self, node_type: &str) -> NodeTypeDescriptor {
        if let Some(desc) = builtin::descriptor(node_type) {
            return desc;
        }
        self.registry
            .snapshot()
            .node_type(node_type)
            .cloned()
            .unwrap_or_else(|| NodeTypeDescriptor::builtin(node_type, false))
    }

    pub(crate) fn graph(&self, graph_id: &str) -> Option<Arc<GraphModel>> {
        self.graphs.read().ok()?.get(graph_id).cloned()
    }

    fn register_graph(&self, mut graph: WorkflowGraph) -> Result<Arc<GraphModel>> {
        for sub in std::mem::take(&mut graph.subgraphs) {
            self.register_graph(sub)?;
        }
        let model = Arc::new(GraphModel::new(graph)?);
        if let Ok(mut graphs) = self.graphs.write() {
            graphs.insert(model.id().to_string(), model.clone());
        }
        debug!(graph = %model.id(), nodes = model.nodes().len(), "Graph registered");
        Ok(model)
    }

    /// Spawn a run's scheduler. Nested runs pass their parent's token so
    /// cancelling the parent reaches them.
    pub(crate) fn start_model(
        self: &Arc<Self>,
        model: Arc<GraphModel>,
        overrides: ValueMap,
        parent: Option<&CancellationToken>,
    ) -> RunHandle {
        let run_id = RunId::new();
        let mut variables = model.graph().variables.clone();
        variables.extend(overrides);

        let states = model
            .nodes()
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    Arc::new(tokio::sync::Mutex::new(NodeExecutionState::new(&n.id))),
                )
            })
            .collect();
        let (chunks, _) = broadcast::channel(256);
        let (status, _) = watch::channel(RunStatus::Running);
        let (report, _) = watch::channel(None);
        let run = Arc::new(RunShared {
            run_id: run_id.clone(),
            graph_id: model.id().to_string(),
            states,
            suspended: Mutex::new(HashMap::new()),
            chunks,
            status,
            report,
            cancel: parent.map(|p| p.child_token()).unwrap_or_default(),
            permits: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
        });

        let (tx, rx) = mpsc::channel(256);
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(run_id.0.clone(), tx.clone());
        }
        let scheduler = Scheduler::new(self.clone(), model, run.clone(), variables, tx);
        tokio::spawn(scheduler.run(rx));

        RunHandle {
            inner: self.clone(),
            run,
        }
    }

    pub(crate) fn finish_run(&self, run_id: &RunId) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(&run_id.0);
        }
        self.tokens.revoke_run(run_id);
    }

    async fn resume(&self, token: ExecutionToken, decision: Value) -> Result<()> {
        let inbox = self
            .runs
            .lock()
            .ok()
            .and_then(|runs| runs.get(&token.run_id).cloned());
        let Some(inbox) = inbox else {
            return Err(WeftError::stale(&token.node_id, "run is not active"));
        };
        let node = token.node_id.clone();
        let (reply, rx) = oneshot::channel();
        inbox
            .send(SchedulerMsg::Resume {
                token,
                decision,
                reply,
            })
            .await
            .map_err(|_| WeftError::stale(&node, "run is not active"))?;
        rx.await
            .map_err(|_| WeftError::stale(&node, "run is not active"))?
    }
}

/// Handle to a started run.
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<EngineInner>,
    run: Arc<RunShared>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run.run_id
    }

    pub fn status(&self) -> RunStatus {
        *self.run.status.borrow()
    }

    /// Request cancellation. In-flight nodes are cancelled and results that
    /// arrive afterwards are dropped.
    pub fn cancel(&self) {
        info!(run_id = %self.run.run_id, "Run cancellation requested");
        self.run.cancel.cancel();
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait(&self) -> RunReport {
        let mut rx = self.run.report.subscribe();
        let report = match rx.wait_for(|r| r.is_some()).await {
            Ok(r) => (*r).clone(),
            Err(_) => None,
        };
        match report {
            Some(report) => report,
            None => RunReport {
                run_id: self.run.run_id.0.clone(),
                graph_id: self.run.graph_id.clone(),
                status: RunStatus::Failed,
                nodes: self.run.snapshot().await,
                errors: vec!["scheduler stopped without a report".into()],
                sinks: vec![],
            },
        }
    }

    /// Wait until nothing is running: the run is either parked on
    /// suspended nodes or finished.
    pub async fn wait_idle(&self) -> RunStatus {
        let mut rx = self.run.status.subscribe();
        // Copied out so the watch borrow ends before `rx` drops.
        let status = match rx.wait_for(|s| *s != RunStatus::Running).await {
            Ok(s) => *s,
            Err(_) => RunStatus::Failed,
        };
        status
    }

    pub async fn snapshot(&self) -> BTreeMap<String, NodeExecutionState> {
        self.run.snapshot().await
    }

    /// Nodes currently parked, by node id.
    pub fn suspended(&self) -> Vec<SuspendedNode> {
        self.run.parked()
    }

    pub async fn resume(&self, token: ExecutionToken, decision: Value) -> Result<()> {
        self.inner.resume(token, decision).await
    }

    pub fn subscribe_chunks(&self) -> broadcast::Receiver<NodeChunk> {
        self.run.chunks.subscribe()
    }
}

/// Executes workflow graphs.
///
/// Cheap to clone; all clones share the registry, router, token issuer and
/// graph catalog.
#[derive(Clone)]
pub struct NodeExecutionEngine {
    inner: Arc<EngineInner>,
}

impl NodeExecutionEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn router(&self) -> &Arc<ExecutorRouter> {
        &self.inner.router
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Validate a graph (and its subgraphs) and add it to the catalog used
    /// to resolve loop bodies.
    pub fn register_graph(&self, graph: WorkflowGraph) -> Result<Arc<GraphModel>> {
        self.inner.register_graph(graph)
    }

    pub fn graph(&self, graph_id: &str) -> Option<Arc<GraphModel>> {
        self.inner.graph(graph_id)
    }

    /// Validate and start a run. Variables override the graph's defaults.
    pub fn start(&self, graph: WorkflowGraph, variables: ValueMap) -> Result<RunHandle> {
        let model = self.register_graph(graph)?;
        Ok(self.inner.start_model(model, variables, None))
    }

    /// Start a run of a graph already in the catalog.
    pub fn start_registered(&self, graph_id: &str, variables: ValueMap) -> Result<RunHandle> {
        let model = self
            .graph(graph_id)
            .ok_or_else(|| WeftError::validation(format!("unknown graph '{}'", graph_id)))?;
        Ok(self.inner.start_model(model, variables, None))
    }

    /// Start a run and wait for its report.
    pub async fn run(&self, graph: WorkflowGraph, variables: ValueMap) -> Result<RunReport> {
        Ok(self.start(graph, variables)?.wait().await)
    }

    /// Resume a suspended node of any active run, including nested loop runs.
    ///
    /// Fails with `StaleToken` when the token was already redeemed, does not
    /// match the suspension, or its run is no longer active.
    pub async fn resume(&self, token: ExecutionToken, decision: Value) -> Result<()> {
        self.inner.resume(token, decision).await
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .runs
            .lock()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// Builder for [`NodeExecutionEngine`]. Anything not supplied gets a
/// default: empty registry, router from config, in-memory checkpoints,
/// the config's policies and the built-in expression engine.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<PluginRegistry>>,
    router: Option<Arc<ExecutorRouter>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    policies: Option<Arc<dyn PolicySource>>,
    expressions: Option<Arc<dyn Expression>>,
    events: Option<Arc<EventBus>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl EngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_router(mut self, router: Arc<ExecutorRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_policy_source(mut self, source: Arc<dyn PolicySource>) -> Self {
        self.policies = Some(source);
        self
    }

    pub fn with_expression_engine(mut self, engine: Arc<dyn Expression>) -> Self {
        self.expressions = Some(engine);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn build(self) -> NodeExecutionEngine {
        let exprs = Arc::new(match self.expressions {
            Some(engine) => ExpressionCache::new(engine),
            None => ExpressionCache::default(),
        });
        let policies: Arc<dyn PolicySource> = match self.policies {
            Some(source) => source,
            None => Arc::new(self.config.policies.clone()),
        };
        let checkpoints: Arc<dyn CheckpointStore> = match self.checkpoints {
            Some(store) => store,
            None => Arc::new(MemoryCheckpointStore::new()),
        };
        let router = self
            .router
            .unwrap_or_else(|| Arc::new(ExecutorRouter::new(self.config.router.clone())));

        NodeExecutionEngine {
            inner: Arc::new(EngineInner {
                registry: self.registry.unwrap_or_default(),
                router,
                checkpoints,
                gate: GuardrailGate::new(policies, exprs.clone()),
                exprs,
                events: self.events.unwrap_or_default(),
                audit: self.audit,
                tokens: TokenIssuer::new(self.config.engine.token_ttl_secs),
                retry: RetryPolicy::new(self.config.retry.clone()),
                config: self.config.engine.clone(),
                graphs: RwLock::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }
}
