use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use weft_core::error::{ErrorKind, Result, WeftError};
use weft_core::event::EngineEvent;
use weft_core::types::{
    ExecutionToken, NodeStatus, ResumeContext, RunStatus, ValueMap,
};

use crate::engine::{EngineInner, RunReport, RunShared, SuspendedNode};
use crate::graph::{GraphModel, NodeInstance};
use crate::state::NodeError;
use crate::worker::Worker;

pub(crate) enum SchedulerMsg {
    Finished {
        node_id: String,
        outcome: WorkerOutcome,
    },
    Resume {
        token: ExecutionToken,
        decision: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    SuspendExpired {
        node_id: String,
        nonce: String,
    },
}

/// What a worker reports back for one node.
pub(crate) enum WorkerOutcome {
    Completed(Value),
    Suspended { state_tag: String, awaiting: Value },
    Failed(WeftError),
    /// The pre-check denied the node before dispatch.
    Denied(WeftError),
    Cancelled,
}

#[derive(Debug, Clone)]
enum EdgeState {
    Unresolved,
    Taken(Value),
    /// A routing choice passed this edge over. Another incoming edge may
    /// still make the target ready.
    NotTaken(String),
    /// The source failed without a handler, or was skipped for a reason
    /// other than routing. The target cannot run.
    Blocked(String),
}

enum Carried<'a> {
    Output(&'a Value),
    Failure(Value),
    Nothing,
}

enum Readiness {
    Waiting,
    Ready,
    /// Every incoming edge was passed over by routing.
    Unrouted(String),
    /// A required upstream node failed or was skipped.
    Blocked(String),
}

/// Drives one run: owns edge resolution and readiness, commits worker
/// results to node state and handles resume, expiry and cancellation.
pub(crate) struct Scheduler {
    inner: Arc<EngineInner>,
    model: Arc<GraphModel>,
    run: Arc<RunShared>,
    variables: ValueMap,
    tx: mpsc::Sender<SchedulerMsg>,
    edges: Vec<EdgeState>,
    outputs: HashMap<String, Value>,
    dispatched: HashSet<String>,
    to_evaluate: VecDeque<String>,
    in_flight: usize,
    errors: Vec<String>,
    unhandled: usize,
    aborted: bool,
    cancelled: bool,
}

impl Scheduler {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        model: Arc<GraphModel>,
        run: Arc<RunShared>,
        variables: ValueMap,
        tx: mpsc::Sender<SchedulerMsg>,
    ) -> Self {
        let edges = vec![EdgeState::Unresolved; model.edge_count()];
        Self {
            inner,
            model,
            run,
            variables,
            tx,
            edges,
            outputs: HashMap::new(),
            dispatched: HashSet::new(),
            to_evaluate: VecDeque::new(),
            in_flight: 0,
            errors: vec![],
            unhandled: 0,
            aborted: false,
            cancelled: false,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<SchedulerMsg>) {
        let run_id = self.run.run_id.clone();
        info!(
            run_id = %run_id,
            graph = %self.model.id(),
            nodes = self.model.nodes().len(),
            "Run started"
        );
        self.inner.emit(EngineEvent::RunStarted {
            run_id: run_id.0.clone(),
            graph_id: self.model.id().to_string(),
        });

        let entries: Vec<String> = self
            .model
            .entry_nodes()
            .into_iter()
            .map(str::to_string)
            .collect();
        for id in entries {
            self.make_ready(&id).await;
        }
        self.drain().await;

        let cancel = self.run.cancel.clone();
        loop {
            let parked = self.run.parked().len();
            if self.in_flight == 0 && (parked == 0 || self.cancelled) {
                break;
            }
            let status = if self.in_flight == 0 {
                RunStatus::Suspended
            } else {
                RunStatus::Running
            };
            self.run.status.send_replace(status);

            tokio::select! {
                _ = cancel.cancelled(), if !self.cancelled => self.cancel_all().await,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
            self.drain().await;
        }

        self.finish().await;
    }

    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Finished { node_id, outcome } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.on_finished(&node_id, outcome).await;
            }
            SchedulerMsg::Resume {
                token,
                decision,
                reply,
            } => {
                let result = self.resume(token, decision).await;
                // Visible before the caller returns, so a following
                // `wait_idle` does not see the stale parked status.
                if result.is_ok() && self.in_flight > 0 {
                    self.run.status.send_replace(RunStatus::Running);
                }
                let _ = reply.send(result);
            }
            SchedulerMsg::SuspendExpired { node_id, nonce } => {
                self.expire(&node_id, &nonce).await;
            }
        }
    }

    /// Evaluate queued targets until nothing more becomes ready or dead.
    async fn drain(&mut self) {
        while let Some(target) = self.to_evaluate.pop_front() {
            if self.cancelled || self.aborted {
                self.to_evaluate.clear();
                return;
            }
            if self.dispatched.contains(&target) {
                continue;
            }
            match self.readiness(&target) {
                Readiness::Waiting => {}
                Readiness::Ready => self.make_ready(&target).await,
                Readiness::Unrouted(reason) => self.skip_node(&target, reason, true).await,
                Readiness::Blocked(reason) => self.skip_node(&target, reason, false).await,
            }
        }
    }

    fn readiness(&self, node_id: &str) -> Readiness {
        let incoming = self.model.incoming(node_id);
        let mut states = incoming.iter().map(|i| &self.edges[*i]);
        if states.clone().any(|e| matches!(e, EdgeState::Unresolved)) {
            return Readiness::Waiting;
        }
        if let Some(cause) = states.clone().find_map(|e| match e {
            EdgeState::Blocked(cause) => Some(cause.clone()),
            _ => None,
        }) {
            return Readiness::Blocked(cause);
        }
        if states.clone().any(|e| matches!(e, EdgeState::Taken(_))) {
            return Readiness::Ready;
        }
        let cause = states
            .find_map(|e| match e {
                EdgeState::NotTaken(cause) => Some(cause.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "no incoming branch taken".to_string());
        Readiness::Unrouted(cause)
    }

    /// Values carried by taken incoming edges. Entry nodes start from the
    /// run variables.
    fn carried_inputs(&self, node_id: &str) -> ValueMap {
        let incoming = self.model.incoming(node_id);
        if incoming.is_empty() {
            return self.variables.clone();
        }
        let mut base = ValueMap::new();
        for idx in incoming {
            let EdgeState::Taken(value) = &self.edges[*idx] else {
                continue;
            };
            match (&self.model.edge(*idx).target_port, value) {
                (Some(port), v) => {
                    base.insert(port.clone(), v.clone());
                }
                (None, Value::Object(map)) => {
                    base.extend(map.clone());
                }
                (None, v) => {
                    base.insert("input".to_string(), v.clone());
                }
            }
        }
        base
    }

    async fn make_ready(&mut self, node_id: &str) {
        let Some(node) = self.model.node(node_id).cloned() else {
            return;
        };
        self.dispatched.insert(node_id.to_string());
        let base = self.carried_inputs(node_id);
        let inputs = match self.model.resolve_inputs(
            &node,
            &self.variables,
            &self.outputs,
            base,
            &self.inner.exprs,
        ) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail_node(node_id, e).await;
                return;
            }
        };
        if let Ok(state) = self.run.state(node_id) {
            state.lock().await.inputs = inputs.clone();
        }
        debug!(run_id = %self.run.run_id, node_id = %node_id, "Node ready");
        self.spawn_worker(node, inputs, None);
    }

    fn spawn_worker(&mut self, node: NodeInstance, inputs: ValueMap, resume: Option<ResumeContext>) {
        self.in_flight += 1;
        let worker = Worker::new(self.inner.clone(), self.run.clone());
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let node_id = node.id.clone();
            let outcome = worker.run_node(node, inputs, resume).await;
            if tx
                .send(SchedulerMsg::Finished {
                    node_id: node_id.clone(),
                    outcome,
                })
                .await
                .is_err()
            {
                debug!(node_id = %node_id, "Scheduler gone, worker result dropped");
            }
        });
    }

    async fn on_finished(&mut self, node_id: &str, outcome: WorkerOutcome) {
        let Ok(state) = self.run.state(node_id) else {
            return;
        };
        let terminal = state.lock().await.is_terminal();
        if self.cancelled || self.aborted || terminal {
            if !matches!(outcome, WorkerOutcome::Cancelled) {
                warn!(run_id = %self.run.run_id, node_id = %node_id, "Late result dropped");
                self.inner.emit(EngineEvent::LateResultDropped {
                    run_id: self.run.run_id.0.clone(),
                    node_id: node_id.to_string(),
                });
            }
            return;
        }
        match outcome {
            WorkerOutcome::Completed(output) => self.complete_node(node_id, output).await,
            WorkerOutcome::Suspended { state_tag, awaiting } => {
                self.suspend_node(node_id, state_tag, awaiting).await
            }
            WorkerOutcome::Failed(e) => self.fail_node(node_id, e).await,
            WorkerOutcome::Denied(err) => self.deny_node(node_id, err).await,
            WorkerOutcome::Cancelled => self.fail_node(node_id, WeftError::Cancelled).await,
        }
    }

    fn guard_vars(&self, inputs: &ValueMap, output: &Value) -> ValueMap {
        let mut vars = self.variables.clone();
        vars.extend(inputs.clone());
        if let Value::Object(fields) = output {
            vars.extend(fields.clone());
        }
        vars.insert("output".to_string(), output.clone());
        vars
    }

    async fn complete_node(&mut self, node_id: &str, output: Value) {
        let Ok(state) = self.run.state(node_id) else {
            return;
        };
        let inputs = state.lock().await.inputs.clone();
        let guard_vars = self.guard_vars(&inputs, &output);
        let selected = self
            .model
            .select_edges(node_id, &guard_vars, &self.inner.exprs);

        self.outputs.insert(node_id.to_string(), output.clone());
        let taken = match selected {
            Ok(taken) => taken,
            Err(e) => {
                // The output stays visible to bindings even though routing failed.
                state.lock().await.output = Some(output);
                self.fail_node(node_id, e).await;
                return;
            }
        };

        if let Err(e) = state.lock().await.complete(output.clone()) {
            warn!(node_id = %node_id, error = %e, "Cannot complete node");
            return;
        }
        info!(run_id = %self.run.run_id, node_id = %node_id, taken = taken.len(), "Node completed");
        self.inner.emit(EngineEvent::NodeCompleted {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.to_string(),
            output: output.clone(),
        });
        self.settle_edges(
            node_id,
            &taken,
            Carried::Output(&output),
            EdgeState::NotTaken("branch not taken".to_string()),
        );
    }

    async fn fail_node(&mut self, node_id: &str, err: WeftError) {
        let Ok(state) = self.run.state(node_id) else {
            return;
        };
        if let Err(e) = state.lock().await.fail(&err) {
            warn!(node_id = %node_id, error = %e, "Cannot record node failure");
            return;
        }
        self.dispatched.insert(node_id.to_string());
        let kind = err.kind();
        warn!(
            run_id = %self.run.run_id,
            node_id = %node_id,
            kind = ?kind,
            error = %err,
            "Node failed"
        );
        self.inner.emit(EngineEvent::NodeFailed {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.to_string(),
            kind,
            error: err.to_string(),
        });

        let handlers = self.model.error_edges(node_id, kind);
        if handlers.is_empty() {
            self.unhandled += 1;
            self.errors.push(format!("{}: {}", node_id, err));
            if kind == ErrorKind::FatalOrchestration {
                self.abort(node_id);
                return;
            }
        } else {
            state.lock().await.recovered = true;
        }
        let payload = json!({
            "node": node_id,
            "kind": kind,
            "error": err.to_string(),
        });
        let cause = format!("upstream {} failed", node_id);
        // A handled failure routes; an unhandled one blocks every successor.
        let untaken = if handlers.is_empty() {
            EdgeState::Blocked(cause)
        } else {
            EdgeState::NotTaken(cause)
        };
        self.settle_edges(node_id, &handlers, Carried::Failure(payload), untaken);
    }

    /// `routed` skips come from branch selection and only pass the skip on
    /// as routing; any other skip blocks the node's successors.
    async fn skip_node(&mut self, node_id: &str, reason: String, routed: bool) {
        let Ok(state) = self.run.state(node_id) else {
            return;
        };
        if let Err(e) = state.lock().await.skip(reason.clone()) {
            debug!(node_id = %node_id, error = %e, "Node not skippable");
            return;
        }
        self.dispatched.insert(node_id.to_string());
        info!(run_id = %self.run.run_id, node_id = %node_id, reason = %reason, "Node skipped");
        self.inner.emit(EngineEvent::NodeSkipped {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.to_string(),
            reason,
        });
        let cause = format!("upstream {} skipped", node_id);
        let untaken = if routed {
            EdgeState::NotTaken(cause)
        } else {
            EdgeState::Blocked(cause)
        };
        self.settle_edges(node_id, &[], Carried::Nothing, untaken);
    }

    /// A denied node is skipped, not failed; the denial is kept as its error.
    async fn deny_node(&mut self, node_id: &str, err: WeftError) {
        let reason = match &err {
            WeftError::GuardrailBlocked { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        self.skip_node(node_id, format!("guardrail: {}", reason), false)
            .await;
        if let Ok(state) = self.run.state(node_id) {
            let mut s = state.lock().await;
            if s.status == NodeStatus::Skipped {
                s.error = Some(NodeError::from(&err));
            }
        }
    }

    /// Resolve every outgoing edge of `node_id` and queue the targets.
    fn settle_edges(
        &mut self,
        node_id: &str,
        taken: &[usize],
        carried: Carried<'_>,
        untaken: EdgeState,
    ) {
        let model = self.model.clone();
        for idx in model.outgoing(node_id) {
            let edge = model.edge(*idx);
            self.edges[*idx] = if taken.contains(idx) {
                EdgeState::Taken(match &carried {
                    Carried::Output(output) => edge.carried(output),
                    Carried::Failure(payload) => payload.clone(),
                    Carried::Nothing => Value::Null,
                })
            } else {
                untaken.clone()
            };
            self.to_evaluate.push_back(edge.target.clone());
        }
    }

    async fn suspend_node(&mut self, node_id: &str, state_tag: String, awaiting: Value) {
        let Ok(state) = self.run.state(node_id) else {
            return;
        };
        let payload = match serde_json::to_vec(&awaiting) {
            Ok(p) => p,
            Err(e) => {
                self.fail_node(node_id, e.into()).await;
                return;
            }
        };
        if let Err(e) = self
            .inner
            .checkpoints
            .save(
                self.run.run_id.0.clone(),
                node_id.to_string(),
                state_tag.clone(),
                payload,
            )
            .await
        {
            self.fail_node(node_id, e).await;
            return;
        }

        let attempt = {
            let mut s = state.lock().await;
            if let Err(e) = s.transition(NodeStatus::Suspended) {
                warn!(node_id = %node_id, error = %e, "Cannot suspend node");
                return;
            }
            s.attempts
        };
        let token = self.inner.tokens.mint(&self.run.run_id, node_id, attempt);
        if let Ok(mut parked) = self.run.suspended.lock() {
            parked.insert(
                node_id.to_string(),
                SuspendedNode {
                    node_id: node_id.to_string(),
                    state_tag: state_tag.clone(),
                    awaiting,
                    token: token.clone(),
                },
            );
        }
        info!(run_id = %self.run.run_id, node_id = %node_id, state_tag = %state_tag, "Node suspended");
        self.inner.emit(EngineEvent::NodeSuspended {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.to_string(),
            state_tag,
        });

        if let Some(timeout) = self.inner.config.hitl_timeout() {
            let tx = self.tx.clone();
            let node_id = node_id.to_string();
            let nonce = token.nonce;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(SchedulerMsg::SuspendExpired { node_id, nonce }).await;
            });
        }
    }

    async fn resume(&mut self, token: ExecutionToken, decision: Value) -> Result<()> {
        let node_id = token.node_id.clone();
        let parked = self
            .run
            .suspended
            .lock()
            .ok()
            .and_then(|s| s.get(&node_id).cloned());
        let Some(parked) = parked else {
            return Err(WeftError::stale(&node_id, "node is not suspended"));
        };
        if parked.token.nonce != token.nonce {
            return Err(WeftError::stale(&node_id, "token does not match the suspension"));
        }
        if parked.token.is_expired() {
            // Nobody can redeem this suspension any more.
            self.expire(&node_id, &parked.token.nonce).await;
            return Err(WeftError::stale(&node_id, "token expired"));
        }
        self.inner.tokens.redeem(&token)?;

        let run_id = self.run.run_id.0.clone();
        let loaded = self
            .inner
            .checkpoints
            .load(run_id.clone(), node_id.clone())
            .await;
        let record = match loaded {
            Ok(Some(record)) => record,
            other => {
                let message = match other {
                    Err(WeftError::Checkpoint(m)) => m,
                    Err(e) => e.to_string(),
                    Ok(_) => format!("no checkpoint for node {}", node_id),
                };
                // The token is spent; the node cannot be resumed any more.
                self.unpark(&node_id);
                self.fail_node(&node_id, WeftError::Checkpoint(message.clone()))
                    .await;
                return Err(WeftError::Checkpoint(message));
            }
        };
        let awaiting: Value = match serde_json::from_slice(&record.payload) {
            Ok(v) => v,
            Err(e) => {
                let message = format!("corrupt checkpoint for node {}: {}", node_id, e);
                self.unpark(&node_id);
                self.fail_node(&node_id, WeftError::Checkpoint(message.clone()))
                    .await;
                return Err(WeftError::Checkpoint(message));
            }
        };
        if let Err(e) = self.inner.checkpoints.delete(run_id, node_id.clone()).await {
            warn!(node_id = %node_id, error = %e, "Failed to delete checkpoint");
        }
        self.unpark(&node_id);

        let state = self.run.state(&node_id)?;
        let inputs = {
            let mut s = state.lock().await;
            s.transition(NodeStatus::Running)?;
            s.inputs.clone()
        };
        let node = self
            .model
            .node(&node_id)
            .cloned()
            .ok_or_else(|| WeftError::validation(format!("unknown node '{}'", node_id)))?;

        info!(run_id = %self.run.run_id, node_id = %node_id, "Node resumed");
        self.inner.emit(EngineEvent::NodeResumed {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.clone(),
        });
        self.spawn_worker(
            node,
            inputs,
            Some(ResumeContext {
                state_tag: record.state_tag,
                awaiting,
                decision,
            }),
        );
        Ok(())
    }

    fn unpark(&self, node_id: &str) -> Option<SuspendedNode> {
        self.run.suspended.lock().ok()?.remove(node_id)
    }

    /// A human-review timeout fired, or a resume arrived after the token
    /// expired. Stale timers (the node was resumed in the meantime) carry an
    /// old nonce and are ignored.
    async fn expire(&mut self, node_id: &str, nonce: &str) {
        let current = self
            .run
            .suspended
            .lock()
            .ok()
            .and_then(|s| s.get(node_id).map(|p| p.token.nonce == nonce))
            .unwrap_or(false);
        if !current {
            return;
        }
        if let Some(parked) = self.unpark(node_id) {
            let _ = self.inner.tokens.redeem(&parked.token);
        }
        if let Err(e) = self
            .inner
            .checkpoints
            .delete(self.run.run_id.0.clone(), node_id.to_string())
            .await
        {
            warn!(node_id = %node_id, error = %e, "Failed to delete checkpoint");
        }
        let timeout_ms = self
            .inner
            .config
            .hitl_timeout()
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.fail_node(
            node_id,
            WeftError::Timeout {
                executor: node_id.to_string(),
                timeout_ms,
                retryable: false,
            },
        )
        .await;
    }

    /// Fatal orchestration failure: stop everything and fail the run.
    fn abort(&mut self, node_id: &str) {
        warn!(run_id = %self.run.run_id, node_id = %node_id, "Run aborted");
        self.aborted = true;
        self.run.cancel.cancel();
    }

    async fn cancel_all(&mut self) {
        self.cancelled = true;
        info!(run_id = %self.run.run_id, in_flight = self.in_flight, "Cancelling run");
        for node in self.model.nodes() {
            let Ok(state) = self.run.state(&node.id) else {
                continue;
            };
            let mut s = state.lock().await;
            if !s.is_terminal() && s.transition(NodeStatus::Cancelled).is_ok() {
                self.inner.emit(EngineEvent::NodeCancelled {
                    run_id: self.run.run_id.0.clone(),
                    node_id: node.id.clone(),
                });
            }
        }
        let parked: Vec<SuspendedNode> = self
            .run
            .suspended
            .lock()
            .map(|mut s| s.drain().map(|(_, p)| p).collect())
            .unwrap_or_default();
        for p in parked {
            let _ = self
                .inner
                .checkpoints
                .delete(self.run.run_id.0.clone(), p.node_id)
                .await;
        }
        self.inner.tokens.revoke_run(&self.run.run_id);
    }

    async fn finish(self) {
        let run_id = self.run.run_id.clone();
        for node in self.model.nodes() {
            let Ok(state) = self.run.state(&node.id) else {
                continue;
            };
            let mut s = state.lock().await;
            if s.is_terminal() {
                continue;
            }
            let _ = if self.cancelled {
                s.transition(NodeStatus::Cancelled)
            } else {
                s.skip("not reached")
            };
        }

        let status = if self.aborted {
            RunStatus::Failed
        } else if self.cancelled {
            RunStatus::Cancelled
        } else if self.unhandled > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        self.inner.finish_run(&run_id);
        let report = RunReport {
            run_id: run_id.0.clone(),
            graph_id: self.model.id().to_string(),
            status,
            nodes: self.run.snapshot().await,
            errors: self.errors,
            sinks: self
                .model
                .sink_nodes()
                .into_iter()
                .map(str::to_string)
                .collect(),
        };
        info!(
            run_id = %run_id,
            status = %status,
            errors = report.errors.len(),
            "Run finished"
        );
        self.inner.emit(EngineEvent::RunCompleted {
            run_id: run_id.0.clone(),
            status,
        });
        self.run.status.send_replace(status);
        self.run.report.send_replace(Some(report));
    }
}
