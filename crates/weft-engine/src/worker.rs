use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::event::EngineEvent;
use weft_core::policy::{GuardrailResult, PolicyPhase};
use weft_core::types::{
    ExecutionOutcome, ExecutorBinding, NodeContext, NodeStatus, ResumeContext, ValueMap,
};

use crate::builtin;
use crate::engine::{EngineInner, NodeChunk, RunShared};
use crate::graph::{GraphModel, NodeInstance};
use crate::guardrail::GuardrailGate;
use crate::scheduler::WorkerOutcome;
use crate::state::NodeExecutionState;

/// Runs one node: guardrail checks, attempts with retry, and output shaping.
pub(crate) struct Worker {
    inner: Arc<EngineInner>,
    run: Arc<RunShared>,
}

impl Worker {
    pub(crate) fn new(inner: Arc<EngineInner>, run: Arc<RunShared>) -> Self {
        Self { inner, run }
    }

    pub(crate) async fn run_node(
        &self,
        node: NodeInstance,
        inputs: ValueMap,
        resume: Option<ResumeContext>,
    ) -> WorkerOutcome {
        match self.execute(&node, inputs, resume).await {
            Ok(outcome) => outcome,
            Err(WeftError::Cancelled) => WorkerOutcome::Cancelled,
            Err(e) => WorkerOutcome::Failed(e),
        }
    }

    async fn execute(
        &self,
        node: &NodeInstance,
        inputs: ValueMap,
        resume: Option<ResumeContext>,
    ) -> Result<WorkerOutcome> {
        let descriptor = self.inner.descriptor(&node.node_type);
        let state = self.run.state(&node.id)?;

        let mut ctx = NodeContext::new(self.run.run_id.0.clone(), node.id.clone(), node.node_type.clone());
        ctx.inputs = inputs.into_iter().collect();
        ctx.config = node.config.clone();
        ctx.cancel = self.run.cancel.child_token();
        let resuming = resume.is_some();
        ctx.resume = resume;

        if !resuming {
            let pre = self.inner.gate.pre_check(&ctx, &descriptor)?;
            self.report_guardrail(&node.id, PolicyPhase::Pre, &pre);
            if !pre.allowed {
                return Ok(WorkerOutcome::Denied(GuardrailGate::blocked(&pre)));
            }
            if let Some(Value::Object(redacted)) = pre.redacted {
                ctx.inputs = redacted.into_iter().collect();
            }
            // Fails only when the run was cancelled while the node waited.
            state
                .lock()
                .await
                .transition(NodeStatus::Running)
                .map_err(|_| WeftError::Cancelled)?;
        }

        let raw = match node.node_type.as_str() {
            builtin::DECISION => {
                self.begin_attempt(&state, &node.id).await;
                ExecutionOutcome::completed(ctx.inputs_value())
            }
            builtin::HUMAN_REVIEW => {
                if !resuming {
                    self.begin_attempt(&state, &node.id).await;
                }
                builtin::human_review(&ctx)
            }
            builtin::LOOP => {
                self.begin_attempt(&state, &node.id).await;
                ExecutionOutcome::completed(builtin::run_loop(&self.inner, &ctx).await?)
            }
            _ => {
                let binding = self
                    .inner
                    .registry
                    .resolve_binding(&node.node_type, node.executor.as_ref())?;
                self.dispatch_with_retry(&binding, &mut ctx, &state).await?
            }
        };

        match raw {
            ExecutionOutcome::Suspend {
                state_tag,
                awaiting,
            } => {
                if !descriptor.checkpointable {
                    return Err(WeftError::validation(format!(
                        "node type '{}' is not checkpointable and cannot suspend",
                        node.node_type
                    )));
                }
                Ok(WorkerOutcome::Suspended {
                    state_tag,
                    awaiting,
                })
            }
            ExecutionOutcome::Completed { output } => {
                let shaped = GraphModel::shape_output(node, output, &self.inner.exprs)?;
                let post = self.inner.gate.post_check(&shaped, &ctx, &descriptor)?;
                self.report_guardrail(&node.id, PolicyPhase::Post, &post);
                let visible = if !post.allowed {
                    Value::Null
                } else {
                    post.redacted.unwrap_or(shaped)
                };
                Ok(WorkerOutcome::Completed(visible))
            }
        }
    }

    /// Dispatch attempts until one succeeds, the error is not retryable, or
    /// the attempt budget is spent. Each attempt redeems a fresh token.
    async fn dispatch_with_retry(
        &self,
        binding: &ExecutorBinding,
        ctx: &mut NodeContext,
        state: &Mutex<NodeExecutionState>,
    ) -> Result<ExecutionOutcome> {
        loop {
            let attempt = self.begin_attempt(state, &ctx.node_id).await;
            ctx.attempt = attempt;
            let token = self
                .inner
                .tokens
                .mint(&self.run.run_id, &ctx.node_id, attempt);
            self.inner.tokens.redeem(&token)?;

            let cancel = ctx.cancel.clone();
            let result = tokio::select! {
                r = self.attempt(binding, ctx.clone()) => r,
                _ = cancel.cancelled() => Err(WeftError::Cancelled),
            };
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if self.inner.retry.should_retry(&e, attempt) => {
                    let delay = self.inner.retry.backoff(attempt - 1);
                    warn!(
                        node_id = %ctx.node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Node attempt failed, retrying"
                    );
                    self.inner.emit(EngineEvent::NodeRetrying {
                        run_id: self.run.run_id.0.clone(),
                        node_id: ctx.node_id.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(WeftError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt. The concurrency permit covers only the dispatch itself;
    /// ASYNC completions and STREAM chunks are awaited without it.
    async fn attempt(&self, binding: &ExecutorBinding, ctx: NodeContext) -> Result<ExecutionOutcome> {
        let handle = self.inner.router.resolve(binding)?;
        let node_id = ctx.node_id.clone();
        let dispatched = {
            let _permit = self
                .run
                .permits
                .acquire()
                .await
                .map_err(|_| WeftError::Cancelled)?;
            self.inner.router.dispatch(&handle, ctx).await?
        };
        dispatched
            .finish(|chunk| self.publish_chunk(&node_id, chunk))
            .await
    }

    async fn begin_attempt(&self, state: &Mutex<NodeExecutionState>, node_id: &str) -> u32 {
        let attempt = {
            let mut s = state.lock().await;
            s.attempts += 1;
            s.attempts
        };
        debug!(run_id = %self.run.run_id, node_id = %node_id, attempt, "Node attempt started");
        self.inner.emit(EngineEvent::NodeStarted {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.to_string(),
            attempt,
        });
        attempt
    }

    fn publish_chunk(&self, node_id: &str, chunk: Value) {
        let _ = self.run.chunks.send(NodeChunk {
            node_id: node_id.to_string(),
            chunk: chunk.clone(),
        });
        self.inner.emit(EngineEvent::StreamChunk {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.to_string(),
            chunk,
        });
    }

    fn report_guardrail(&self, node_id: &str, phase: PolicyPhase, result: &GuardrailResult) {
        if result.triggered.is_empty() {
            return;
        }
        self.inner.emit(EngineEvent::GuardrailTriggered {
            run_id: self.run.run_id.0.clone(),
            node_id: node_id.to_string(),
            phase,
            policies: result.triggered.clone(),
            allowed: result.allowed,
        });
    }
}
