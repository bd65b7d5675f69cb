use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::config::EngineConfig;
use weft_core::error::{ErrorKind, Result, WeftError};
use weft_core::policy::{Policy, PolicyPhase};
use weft_core::traits::{CheckpointStore, Executor};
use weft_core::types::{
    ExecutionMode, ExecutionOutcome, ExecutorBinding, NodeContext, NodeStatus, RunStatus, ValueMap,
};
use weft_engine::{
    Binding, Edge, MemoryCheckpointStore, NodeExecutionEngine, NodeInstance, SqliteCheckpointStore,
    WorkflowGraph,
};
use weft_registry::PluginRegistry;
use weft_router::ExecutorRouter;
use weft_test_utils::{bind, ConcurrencyProbe, MockExecutor, RecordingAuditSink, Step};

struct Harness {
    registry: Arc<PluginRegistry>,
    router: Arc<ExecutorRouter>,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: Arc::new(PluginRegistry::new()),
            router: Arc::new(ExecutorRouter::default()),
        }
    }

    async fn bind(&self, node_type: &str, exec: MockExecutor) -> Arc<MockExecutor> {
        let exec = Arc::new(exec);
        bind(&self.registry, &self.router, node_type, exec.clone(), false)
            .await
            .unwrap();
        exec
    }

    fn engine(&self) -> weft_engine::EngineBuilder {
        NodeExecutionEngine::builder()
            .with_registry(self.registry.clone())
            .with_router(self.router.clone())
    }
}

fn vars(value: Value) -> ValueMap {
    match value {
        Value::Object(map) => map,
        _ => ValueMap::new(),
    }
}

fn approval_graph() -> WorkflowGraph {
    WorkflowGraph::new("approval")
        .node(NodeInstance::new("decide", "decision"))
        .node(NodeInstance::new("approve", "task"))
        .node(NodeInstance::new("review", "task"))
        .edge(Edge::guarded("decide", "approve", "amount > 100").with_id("true"))
        .edge(Edge::default_route("decide", "review").with_id("false"))
}

#[tokio::test]
async fn decision_routes_on_amount() {
    let h = Harness::new();
    let task = h.bind("task", MockExecutor::new("task")).await;
    let engine = h.engine().build();

    let high = engine
        .run(approval_graph(), vars(json!({"amount": 150})))
        .await
        .unwrap();
    assert_eq!(high.status, RunStatus::Completed);
    assert_eq!(high.status_of("approve"), Some(NodeStatus::Completed));
    assert_eq!(high.status_of("review"), Some(NodeStatus::Skipped));
    assert_eq!(
        high.node("review").unwrap().skip_reason.as_deref(),
        Some("branch not taken")
    );
    assert_eq!(high.output("approve").unwrap()["amount"], 150);

    let low = engine
        .run(approval_graph(), vars(json!({"amount": 50})))
        .await
        .unwrap();
    assert_eq!(low.status_of("approve"), Some(NodeStatus::Skipped));
    assert_eq!(low.status_of("review"), Some(NodeStatus::Completed));
    assert_eq!(task.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn loop_runs_every_item_within_parallel_bound() {
    let h = Harness::new();
    let probe = ConcurrencyProbe::new();
    let work = h
        .bind(
            "work",
            MockExecutor::new("work")
                .with_delay(Duration::from_millis(50))
                .with_probe(probe.clone()),
        )
        .await;
    let engine = h.engine().build();

    let body = WorkflowGraph::new("body").node(NodeInstance::new("work", "work"));
    let graph = WorkflowGraph::new("batch")
        .node(
            NodeInstance::new("each", "loop")
                .with_config("items", json!("items"))
                .with_config("body", json!("body"))
                .with_config("max_parallel", json!(2))
                .with_config("merge", json!("all")),
        )
        .subgraph(body);

    let report = engine
        .run(graph, vars(json!({"items": [1, 2, 3, 4, 5]})))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    let out = report.output("each").unwrap();
    assert_eq!(out["count"], 5);
    let items: Vec<Value> = out["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["item"].clone())
        .collect();
    assert_eq!(items, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    assert_eq!(work.calls(), 5);
    assert!(probe.peak() <= 2, "peak was {}", probe.peak());
    assert!(probe.peak() >= 1);
}

#[tokio::test(start_paused = true)]
async fn slow_sync_executor_times_out() {
    let h = Harness::new();
    let slow = Arc::new(
        MockExecutor::new("slow").then(Step::Sleep(Duration::from_secs(5), json!("late"))),
    );
    h.router.register_executor(slow.clone()).await.unwrap();

    let binding = ExecutorBinding::inproc("slow").with_config("timeout_ms", json!(2000));
    match h.router.call(&binding, NodeContext::new("r", "n", "slow")).await {
        Err(WeftError::Timeout {
            timeout_ms,
            retryable,
            ..
        }) => {
            assert_eq!(timeout_ms, 2000);
            assert!(retryable);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    // Inside a run the timeout is retried, then the node settles failed.
    let engine = h.engine().build();
    let graph = WorkflowGraph::new("timeouts")
        .node(NodeInstance::new("call", "slow").with_executor(binding));
    let report = engine.run(graph, ValueMap::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    let call = report.node("call").unwrap();
    assert_eq!(call.status, NodeStatus::Failed);
    assert_eq!(call.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(call.attempts, 3);
    assert_eq!(slow.calls(), 4);
}

#[tokio::test]
async fn pre_check_denial_skips_without_dispatch() {
    let h = Harness::new();
    let llm = h.bind("llm", MockExecutor::new("llm")).await;
    let audit = Arc::new(RecordingAuditSink::new());
    let policy = Policy::deny(
        "no-secrets",
        PolicyPhase::Pre,
        "prompt contains 'password'",
        "prompt mentions a password",
    );
    let engine = h
        .engine()
        .with_policy_source(Arc::new(vec![policy]))
        .with_audit_sink(audit.clone())
        .build();

    let graph = WorkflowGraph::new("guarded")
        .node(NodeInstance::new("ask", "llm"))
        .node(NodeInstance::new("after", "llm"))
        .edge(Edge::new("ask", "after"));
    let report = engine
        .run(graph, vars(json!({"prompt": "my password is hunter2"})))
        .await
        .unwrap();

    assert_eq!(llm.calls(), 0);
    let ask = report.node("ask").unwrap();
    assert_eq!(ask.status, NodeStatus::Skipped);
    assert_eq!(
        ask.skip_reason.as_deref(),
        Some("guardrail: prompt mentions a password")
    );
    assert_eq!(ask.error.as_ref().unwrap().kind, ErrorKind::GuardrailBlocked);
    assert!(report.errors.is_empty());
    assert_eq!(report.status_of("after"), Some(NodeStatus::Skipped));
    assert_eq!(audit.count("guardrail_triggered"), 1);
    assert_eq!(audit.count("node_started"), 0);
}

#[tokio::test]
async fn human_review_resumes_once() {
    let h = Harness::new();
    let publish = h.bind("publish", MockExecutor::new("publish")).await;
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = h.engine().with_checkpoint_store(store.clone()).build();

    let graph = WorkflowGraph::new("review-flow")
        .node(NodeInstance::new("review", "human_review"))
        .node(NodeInstance::new("publish", "publish"))
        .edge(Edge::new("review", "publish"));
    let handle = engine
        .start(graph, vars(json!({"doc": "draft v1"})))
        .unwrap();

    assert_eq!(handle.wait_idle().await, RunStatus::Suspended);
    let parked = handle.suspended();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].node_id, "review");
    assert_eq!(parked[0].state_tag, "awaiting_review");
    assert_eq!(parked[0].awaiting, json!({"doc": "draft v1"}));
    assert_eq!(store.len().await, 1);
    assert_eq!(publish.calls(), 0);

    let token = parked[0].token.clone();
    handle
        .resume(token.clone(), json!({"approved": true}))
        .await
        .unwrap();
    let again = handle.resume(token, json!({"approved": false})).await;
    assert!(matches!(again, Err(WeftError::StaleToken { .. })));

    let report = handle.wait().await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output("review"), Some(&json!({"approved": true})));
    assert_eq!(report.output("publish").unwrap()["approved"], true);
    assert_eq!(publish.calls(), 1);
    assert_eq!(store.len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_in_flight_and_pending_nodes() {
    let h = Harness::new();
    h.bind(
        "slow",
        MockExecutor::new("slow").then(Step::Sleep(Duration::from_secs(60), json!(1))),
    )
    .await;
    let after = h.bind("after", MockExecutor::new("after")).await;
    let engine = h.engine().build();

    let graph = WorkflowGraph::new("cancel")
        .node(NodeInstance::new("slow", "slow"))
        .node(NodeInstance::new("after", "after"))
        .edge(Edge::new("slow", "after"));
    let handle = engine.start(graph, ValueMap::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let report = handle.wait().await;
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.status_of("slow"), Some(NodeStatus::Cancelled));
    assert_eq!(report.status_of("after"), Some(NodeStatus::Cancelled));
    assert_eq!(after.calls(), 0);
    assert!(engine.active_runs().is_empty());
}

#[tokio::test]
async fn error_edge_recovers_failure() {
    let h = Harness::new();
    h.bind("fetch", MockExecutor::new("fetch").then(Step::Fail("boom".into())))
        .await;
    h.bind("handle", MockExecutor::new("handle")).await;
    let engine = h.engine().build();

    let graph = WorkflowGraph::new("recover")
        .node(NodeInstance::new("fetch", "fetch"))
        .node(NodeInstance::new("use", "handle"))
        .node(NodeInstance::new("fallback", "handle"))
        .edge(Edge::new("fetch", "use"))
        .edge(Edge::on_error("fetch", "fallback", None));
    let report = engine.run(graph, ValueMap::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let fetch = report.node("fetch").unwrap();
    assert_eq!(fetch.status, NodeStatus::Failed);
    assert!(fetch.recovered);
    assert_eq!(
        report.node("use").unwrap().skip_reason.as_deref(),
        Some("upstream fetch failed")
    );
    let fallback = report.output("fallback").unwrap();
    assert_eq!(fallback["node"], "fetch");
    assert_eq!(fallback["kind"], "execution");
}

#[tokio::test]
async fn unhandled_failure_fails_run_but_keeps_outputs() {
    let h = Harness::new();
    h.bind("bad", MockExecutor::new("bad").then(Step::Fail("nope".into())))
        .await;
    h.bind("good", MockExecutor::returning("good", json!({"done": true})))
        .await;
    let engine = h.engine().build();

    let graph = WorkflowGraph::new("mixed")
        .node(NodeInstance::new("a", "bad"))
        .node(NodeInstance::new("b", "good"))
        .node(NodeInstance::new("c", "good"))
        .edge(Edge::new("a", "b"));
    let report = engine.run(graph, ValueMap::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("a:"));
    assert_eq!(report.status_of("b"), Some(NodeStatus::Skipped));
    assert_eq!(report.output("c"), Some(&json!({"done": true})));
    for state in report.nodes.values() {
        assert!(state.status.is_terminal(), "{} left {}", state.node_id, state.status);
    }
}

#[tokio::test(start_paused = true)]
async fn unavailable_executor_is_retried() {
    let h = Harness::new();
    let flaky = h
        .bind(
            "flaky",
            MockExecutor::new("flaky")
                .then(Step::Unavailable)
                .then(Step::Complete(json!("ok"))),
        )
        .await;
    let engine = h.engine().build();
    let mut events = engine.events().subscribe();

    let graph = WorkflowGraph::new("retry").node(NodeInstance::new("call", "flaky"));
    let report = engine.run(graph, ValueMap::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.node("call").unwrap().attempts, 2);
    assert_eq!(flaky.calls(), 2);

    let mut retried = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type() == "node_retrying" {
            retried = true;
        }
    }
    assert!(retried);
}

#[tokio::test]
async fn stream_chunks_reach_observers() {
    let h = Harness::new();
    h.bind(
        "gen",
        MockExecutor::returning("gen", json!("final")).with_chunks(vec![json!("a"), json!("b")]),
    )
    .await;
    let engine = h.engine().build();

    let graph = WorkflowGraph::new("stream").node(NodeInstance::new("gen", "gen"));
    let handle = engine.start(graph, ValueMap::new()).unwrap();
    let mut chunks = handle.subscribe_chunks();

    let report = handle.wait().await;
    assert_eq!(report.output("gen"), Some(&json!("final")));

    let first = chunks.recv().await.unwrap();
    let second = chunks.recv().await.unwrap();
    assert_eq!(first.node_id, "gen");
    assert_eq!(first.chunk, json!("a"));
    assert_eq!(second.chunk, json!("b"));
}

/// Fails every call with an unrecoverable orchestration error.
struct Doomed;

impl Executor for Doomed {
    fn id(&self) -> &str {
        "doomed"
    }

    fn execute(&self, _ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async {
            Err(WeftError::FatalOrchestration {
                errors: vec!["planner gave up".into()],
            })
        })
    }
}

#[tokio::test(start_paused = true)]
async fn fatal_orchestration_aborts_run() {
    let h = Harness::new();
    bind(&h.registry, &h.router, "orchestrate", Arc::new(Doomed), false)
        .await
        .unwrap();
    h.bind(
        "slow",
        MockExecutor::new("slow").then(Step::Sleep(Duration::from_secs(60), json!(1))),
    )
    .await;
    let engine = h.engine().build();

    let graph = WorkflowGraph::new("abort")
        .node(NodeInstance::new("plan", "orchestrate"))
        .node(NodeInstance::new("side", "slow"));
    let report = engine.run(graph, ValueMap::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.status_of("plan"), Some(NodeStatus::Failed));
    assert_eq!(report.status_of("side"), Some(NodeStatus::Cancelled));
    assert!(report.errors[0].contains("planner gave up"));
}

#[tokio::test(start_paused = true)]
async fn review_timeout_fails_node() {
    let h = Harness::new();
    let mut config = EngineConfig::default();
    config.engine.hitl_timeout_secs = Some(30);
    let engine = h.engine().with_config(config).build();

    let graph = WorkflowGraph::new("expiring").node(NodeInstance::new("review", "human_review"));
    let handle = engine.start(graph, ValueMap::new()).unwrap();
    assert_eq!(handle.wait_idle().await, RunStatus::Suspended);
    let token = handle.suspended()[0].token.clone();

    let report = handle.wait().await;
    assert_eq!(report.status, RunStatus::Failed);
    let review = report.node("review").unwrap();
    assert_eq!(review.error.as_ref().unwrap().kind, ErrorKind::Timeout);

    let late = engine.resume(token, json!({"approved": true})).await;
    assert!(matches!(late, Err(WeftError::StaleToken { .. })));
}

#[tokio::test]
async fn sqlite_checkpoint_survives_until_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let store = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
    let h = Harness::new();
    let engine = h.engine().with_checkpoint_store(store.clone()).build();

    let graph = WorkflowGraph::new("durable").node(NodeInstance::new("review", "human_review"));
    let handle = engine.start(graph, vars(json!({"doc": "v2"}))).unwrap();
    assert_eq!(handle.wait_idle().await, RunStatus::Suspended);

    let run_id = handle.run_id().0.clone();
    let record = store
        .load(run_id.clone(), "review".into())
        .await
        .unwrap()
        .expect("checkpoint saved");
    assert_eq!(record.state_tag, "awaiting_review");

    handle.cancel();
    let report = handle.wait().await;
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.status_of("review"), Some(NodeStatus::Cancelled));
    assert!(store.load(run_id, "review".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_parent_blocks_join() {
    let h = Harness::new();
    h.bind("ok", MockExecutor::new("ok")).await;
    h.bind("bad", MockExecutor::new("bad").then(Step::Fail("broken".into())))
        .await;
    let join = h.bind("join", MockExecutor::new("join")).await;
    let engine = h.engine().build();

    let graph = WorkflowGraph::new("diamond")
        .node(NodeInstance::new("a", "ok"))
        .node(NodeInstance::new("b", "ok"))
        .node(NodeInstance::new("c", "bad"))
        .node(NodeInstance::new("d", "join"))
        .edge(Edge::new("a", "b"))
        .edge(Edge::new("a", "c"))
        .edge(Edge::new("b", "d"))
        .edge(Edge::new("c", "d"));
    let report = engine.run(graph, ValueMap::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.status_of("b"), Some(NodeStatus::Completed));
    assert_eq!(report.status_of("c"), Some(NodeStatus::Failed));
    let d = report.node("d").unwrap();
    assert_eq!(d.status, NodeStatus::Skipped);
    assert_eq!(d.skip_reason.as_deref(), Some("upstream c failed"));
    assert_eq!(join.calls(), 0);
}

#[tokio::test]
async fn binding_without_path_is_rejected_before_start() {
    let h = Harness::new();
    let task = h.bind("task", MockExecutor::new("task")).await;
    let engine = h.engine().build();

    let graph = WorkflowGraph::new("racy")
        .node(NodeInstance::new("s", "task"))
        .node(NodeInstance::new("u", "task").with_input(Binding::node_output("v", "s.v")));
    match engine.start(graph, ValueMap::new()) {
        Err(WeftError::Validation(message)) => assert!(message.contains("not upstream"), "{}", message),
        Err(other) => panic!("expected validation error, got {:?}", other),
        Ok(_) => panic!("graph with an unordered binding was accepted"),
    }
    assert_eq!(task.calls(), 0);
    assert!(engine.active_runs().is_empty());
}

#[tokio::test]
async fn expired_resume_token_fails_the_node() {
    let h = Harness::new();
    let publish = h.bind("publish", MockExecutor::new("publish")).await;
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut config = EngineConfig::default();
    config.engine.token_ttl_secs = 1;
    let engine = h
        .engine()
        .with_config(config)
        .with_checkpoint_store(store.clone())
        .build();

    let graph = WorkflowGraph::new("late-review")
        .node(NodeInstance::new("review", "human_review"))
        .node(NodeInstance::new("publish", "publish"))
        .edge(Edge::new("review", "publish"));
    let handle = engine.start(graph, ValueMap::new()).unwrap();
    assert_eq!(handle.wait_idle().await, RunStatus::Suspended);
    let token = handle.suspended()[0].token.clone();

    // Token expiry follows the wall clock.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let late = handle.resume(token, json!({"approved": true})).await;
    assert!(matches!(late, Err(WeftError::StaleToken { .. })), "{:?}", late);

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run settles after an expired resume");
    assert_eq!(report.status, RunStatus::Failed);
    let review = report.node("review").unwrap();
    assert_eq!(review.status, NodeStatus::Failed);
    assert_eq!(review.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(report.status_of("publish"), Some(NodeStatus::Skipped));
    assert_eq!(publish.calls(), 0);
    assert_eq!(store.len().await, 0);
}

/// Sleeps for `item.ms`, then returns `item.value`.
struct Paced;

impl Executor for Paced {
    fn id(&self) -> &str {
        "paced"
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        let item = ctx.input("item").cloned().unwrap_or(Value::Null);
        Box::pin(async move {
            let ms = item["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ExecutionOutcome::completed(item["value"].clone()))
        })
    }
}

fn paced_loop(merge: &str) -> WorkflowGraph {
    let body = WorkflowGraph::new("paced-body").node(NodeInstance::new("step", "paced"));
    WorkflowGraph::new(&format!("race-{}", merge))
        .node(
            NodeInstance::new("each", "loop")
                .with_config("items", json!("items"))
                .with_config("body", json!("paced-body"))
                .with_config("max_parallel", json!(3))
                .with_config("merge", json!(merge)),
        )
        .subgraph(body)
}

#[tokio::test(start_paused = true)]
async fn loop_first_and_any_merges() {
    let h = Harness::new();
    bind(&h.registry, &h.router, "paced", Arc::new(Paced), false)
        .await
        .unwrap();
    let engine = h.engine().build();
    let items = json!({"items": [
        {"ms": 10, "value": null},
        {"ms": 20, "value": 2},
        {"ms": 30, "value": 3},
    ]});

    // FIRST takes the earliest finisher even when its result is null.
    let first = engine.run(paced_loop("first"), vars(items.clone())).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.output("each"), Some(&json!({"count": 1, "result": null})));

    // ANY skips null results.
    let any = engine.run(paced_loop("any"), vars(items)).await.unwrap();
    assert_eq!(any.output("each"), Some(&json!({"count": 1, "result": 2})));

    let nothing = engine
        .run(
            paced_loop("any"),
            vars(json!({"items": [{"ms": 5, "value": null}, {"ms": 1, "value": null}]})),
        )
        .await
        .unwrap();
    assert_eq!(nothing.output("each"), Some(&json!({"count": 0, "result": null})));
}

/// Counts executions that ran to completion.
struct Counted {
    inner: MockExecutor,
    finished: AtomicUsize,
}

impl Executor for Counted {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            let outcome = self.inner.execute(ctx).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            outcome
        })
    }
}

#[tokio::test(start_paused = true)]
async fn parked_async_node_frees_its_permit() {
    let h = Harness::new();
    let parked = Arc::new(Counted {
        inner: MockExecutor::new("parked").then(Step::Sleep(Duration::from_secs(10), json!("late"))),
        finished: AtomicUsize::new(0),
    });
    bind(&h.registry, &h.router, "parked", parked.clone(), false)
        .await
        .unwrap();
    let quick = h.bind("quick", MockExecutor::new("quick")).await;
    let mut config = EngineConfig::default();
    config.engine.max_concurrency = 1;
    let engine = h.engine().with_config(config).build();

    let graph = WorkflowGraph::new("async-permit")
        .node(
            NodeInstance::new("wait", "parked")
                .with_executor(ExecutorBinding::inproc("parked").with_mode(ExecutionMode::Async)),
        )
        .node(NodeInstance::new("quick", "quick"));
    let handle = engine.start(graph, ValueMap::new()).unwrap();

    // The single permit is free again once the ASYNC submission is accepted.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let states = handle.snapshot().await;
    assert_eq!(states["quick"].status, NodeStatus::Completed);
    assert_eq!(states["wait"].status, NodeStatus::Running);
    assert_eq!(quick.calls(), 1);
    assert_eq!(parked.finished.load(Ordering::SeqCst), 0);
    assert_eq!(h.router.broker().pending_ids().await.len(), 1);

    let report = handle.wait().await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output("wait"), Some(&json!("late")));
    assert_eq!(parked.finished.load(Ordering::SeqCst), 1);
    assert!(h.router.broker().pending_ids().await.is_empty());
}
