//! Node types the engine executes itself: `decision`, `loop` and
//! `human_review`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use weft_core::descriptor::NodeTypeDescriptor;
use weft_core::error::{Result, WeftError};
use weft_core::types::{ExecutionOutcome, NodeContext, RunStatus, ValueMap};

use crate::engine::{EngineInner, RunReport};

/// Passes its resolved inputs through; routing happens on its edges.
pub const DECISION: &str = "decision";
/// Runs a nested graph once per item of a collection input.
pub const LOOP: &str = "loop";
/// Suspends until a reviewer resumes it with a decision.
pub const HUMAN_REVIEW: &str = "human_review";

pub const AWAITING_REVIEW: &str = "awaiting_review";

pub fn descriptor(node_type: &str) -> Option<NodeTypeDescriptor> {
    match node_type {
        DECISION => Some(NodeTypeDescriptor::builtin(DECISION, false)),
        LOOP => Some(NodeTypeDescriptor::builtin(LOOP, false)),
        HUMAN_REVIEW => Some(NodeTypeDescriptor::builtin(HUMAN_REVIEW, true)),
        _ => None,
    }
}

pub fn is_builtin(node_type: &str) -> bool {
    descriptor(node_type).is_some()
}

/// How a loop combines its iteration results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Every iteration must succeed; results keep item order.
    #[default]
    All,
    /// First iteration to succeed wins; the rest are cancelled.
    First,
    /// First non-null result wins.
    Any,
}

pub(crate) fn human_review(ctx: &NodeContext) -> ExecutionOutcome {
    match &ctx.resume {
        Some(resume) => ExecutionOutcome::completed(resume.decision.clone()),
        None => ExecutionOutcome::suspend(AWAITING_REVIEW, ctx.inputs_value()),
    }
}

/// Loop settings read from node config.
struct LoopSpec {
    items_key: String,
    max_parallel: usize,
    merge: MergePolicy,
    body: Option<String>,
}

impl LoopSpec {
    fn from_config(config: &ValueMap, default_parallel: usize) -> Result<Self> {
        let merge = match config.get("merge") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| WeftError::validation(format!("loop merge policy: {}", e)))?,
            None => MergePolicy::All,
        };
        Ok(Self {
            items_key: config
                .get("items")
                .and_then(Value::as_str)
                .unwrap_or("items")
                .to_string(),
            max_parallel: config
                .get("max_parallel")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(default_parallel)
                .max(1),
            merge,
            body: config.get("body").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Execute a loop node.
///
/// Each item runs the body graph as a nested run whose variables are the
/// loop's inputs plus `item` and `index`. Without a body every iteration
/// yields its item. ALL yields `{count, results}`; FIRST and ANY yield
/// `{count, result}`.
pub(crate) async fn run_loop(inner: &Arc<EngineInner>, ctx: &NodeContext) -> Result<Value> {
    let spec = LoopSpec::from_config(&ctx.config, inner.config.max_concurrency)?;
    let items = match ctx.input(&spec.items_key) {
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(WeftError::binding(
                &ctx.node_id,
                format!("loop input '{}' is not an array", spec.items_key),
            ))
        }
        None => {
            return Err(WeftError::binding(
                &ctx.node_id,
                format!("loop input '{}' is missing", spec.items_key),
            ))
        }
    };
    let body = match &spec.body {
        Some(id) => Some(inner.graph(id).ok_or_else(|| {
            WeftError::validation(format!("loop body graph '{}' is not registered", id))
        })?),
        None => None,
    };

    debug!(
        node_id = %ctx.node_id,
        items = items.len(),
        max_parallel = spec.max_parallel,
        merge = ?spec.merge,
        "Loop started"
    );

    let total = items.len();
    let cancel = ctx.cancel.child_token();
    let permits = Arc::new(Semaphore::new(spec.max_parallel));
    let mut set = JoinSet::new();
    for (index, item) in items.into_iter().enumerate() {
        let inner = inner.clone();
        let body = body.clone();
        let permits = permits.clone();
        let cancel = cancel.clone();
        let mut vars: ValueMap = ctx
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.insert("item".into(), item.clone());
        vars.insert("index".into(), json!(index));

        set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (index, Err(WeftError::Cancelled));
            };
            if cancel.is_cancelled() {
                return (index, Err(WeftError::Cancelled));
            }
            let result = match body {
                None => Ok(item),
                Some(model) => {
                    let report = inner.start_model(model, vars, Some(&cancel)).wait().await;
                    iteration_result(index, report)
                }
            };
            (index, result)
        });
    }

    let outcome = collect(&mut set, spec.merge, total).await;
    cancel.cancel();
    set.shutdown().await;
    outcome
}

async fn collect(
    set: &mut JoinSet<(usize, Result<Value>)>,
    merge: MergePolicy,
    total: usize,
) -> Result<Value> {
    match merge {
        MergePolicy::All => {
            let mut results = vec![Value::Null; total];
            while let Some(joined) = set.join_next().await {
                let (index, result) = joined.map_err(|e| WeftError::execution(LOOP, e.to_string()))?;
                results[index] = result?;
            }
            Ok(json!({"count": total, "results": results}))
        }
        MergePolicy::First | MergePolicy::Any => {
            let mut last_error = None;
            let mut succeeded = false;
            while let Some(joined) = set.join_next().await {
                let (_, result) = joined.map_err(|e| WeftError::execution(LOOP, e.to_string()))?;
                match result {
                    Ok(v) if merge == MergePolicy::First || !v.is_null() => {
                        return Ok(json!({"count": 1, "result": v}));
                    }
                    Ok(_) => succeeded = true,
                    Err(e) => last_error = Some(e),
                }
            }
            match last_error {
                Some(e) if !succeeded => Err(e),
                _ => Ok(json!({"count": 0, "result": Value::Null})),
            }
        }
    }
}

fn iteration_result(index: usize, report: RunReport) -> Result<Value> {
    match report.status {
        RunStatus::Completed => Ok(report.result()),
        RunStatus::Cancelled => Err(WeftError::Cancelled),
        status => Err(WeftError::execution(
            LOOP,
            format!(
                "iteration {} {}: {}",
                index,
                status,
                report.errors.join("; ")
            ),
        )),
    }
}
