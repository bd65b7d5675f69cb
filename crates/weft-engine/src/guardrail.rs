use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use weft_core::descriptor::NodeTypeDescriptor;
use weft_core::error::{Result, WeftError};
use weft_core::expression::ExpressionCache;
use weft_core::policy::{GuardrailResult, Policy, PolicyAction, PolicyPhase};
use weft_core::traits::PolicySource;
use weft_core::types::{NodeContext, ValueMap};

/// Evaluates guardrail policies around node execution.
///
/// The pre-check sees the node's resolved inputs and runs before dispatch;
/// a denial means the executor is never called. The post-check sees the
/// produced output before it becomes visible to downstream nodes.
pub struct GuardrailGate {
    source: Arc<dyn PolicySource>,
    exprs: Arc<ExpressionCache>,
    /// Redaction patterns compiled once, keyed by source.
    patterns: RwLock<HashMap<String, Regex>>,
}

impl GuardrailGate {
    pub fn new(source: Arc<dyn PolicySource>, exprs: Arc<ExpressionCache>) -> Self {
        Self {
            source,
            exprs,
            patterns: RwLock::new(HashMap::new()),
        }
    }

    pub fn pre_check(
        &self,
        ctx: &NodeContext,
        descriptor: &NodeTypeDescriptor,
    ) -> Result<GuardrailResult> {
        let inputs = ctx.inputs_value();
        let mut scope = object_fields(&inputs);
        scope.insert("inputs".into(), inputs.clone());
        scope.insert("config".into(), Value::Object(ctx.config.clone()));
        self.check(PolicyPhase::Pre, ctx, descriptor, scope, inputs)
    }

    pub fn post_check(
        &self,
        output: &Value,
        ctx: &NodeContext,
        descriptor: &NodeTypeDescriptor,
    ) -> Result<GuardrailResult> {
        let mut scope = object_fields(output);
        scope.insert("output".into(), output.clone());
        scope.insert("inputs".into(), ctx.inputs_value());
        self.check(PolicyPhase::Post, ctx, descriptor, scope, output.clone())
    }

    fn check(
        &self,
        phase: PolicyPhase,
        ctx: &NodeContext,
        descriptor: &NodeTypeDescriptor,
        mut scope: ValueMap,
        payload: Value,
    ) -> Result<GuardrailResult> {
        scope.insert("node_id".into(), Value::String(ctx.node_id.clone()));
        scope.insert("node_type".into(), Value::String(descriptor.node_type.clone()));

        let mut result = GuardrailResult::allow();
        let mut current = payload;
        for policy in self.applicable(phase, &descriptor.node_type) {
            let triggered = self.exprs.evaluate_bool(&policy.expression, &scope)?;
            if !triggered {
                continue;
            }
            result.triggered.push(policy.id.clone());
            match &policy.action {
                PolicyAction::Deny => {
                    let reason = if policy.deny_message.is_empty() {
                        format!("denied by policy '{}'", policy.id)
                    } else {
                        policy.deny_message.clone()
                    };
                    warn!(
                        node_id = %ctx.node_id,
                        policy = %policy.id,
                        severity = ?policy.severity,
                        "Guardrail denied node"
                    );
                    result.allowed = false;
                    result.reason.get_or_insert(reason);
                }
                PolicyAction::Redact {
                    pattern,
                    replacement,
                } => {
                    let re = self.pattern(&policy.id, pattern)?;
                    current = redact(current, &re, replacement);
                    result.redacted = Some(current.clone());
                    debug!(node_id = %ctx.node_id, policy = %policy.id, "Guardrail redacted payload");
                }
                PolicyAction::Audit => {
                    debug!(node_id = %ctx.node_id, policy = %policy.id, "Guardrail audit trigger");
                }
            }
        }
        Ok(result)
    }

    fn pattern(&self, policy_id: &str, source: &str) -> Result<Regex> {
        {
            let cache = self.patterns.read().unwrap_or_else(|e| e.into_inner());
            if let Some(re) = cache.get(source) {
                return Ok(re.clone());
            }
        }
        let re = Regex::new(source).map_err(|e| {
            WeftError::validation(format!(
                "policy '{}' has an invalid redaction pattern: {}",
                policy_id, e
            ))
        })?;
        self.patterns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.to_string(), re.clone());
        Ok(re)
    }

    fn applicable(&self, phase: PolicyPhase, node_type: &str) -> Vec<Policy> {
        self.source
            .policies()
            .into_iter()
            .filter(|p| p.phase == phase && p.applies_to_type(node_type))
            .collect()
    }

    /// Denial as an error value, for callers that surface it.
    pub fn blocked(result: &GuardrailResult) -> WeftError {
        WeftError::GuardrailBlocked {
            policy: result.triggered.join(","),
            reason: result.reason.clone().unwrap_or_default(),
        }
    }
}

fn object_fields(value: &Value) -> ValueMap {
    match value {
        Value::Object(map) => map.clone(),
        _ => ValueMap::new(),
    }
}

/// Replace matches in every string leaf.
fn redact(value: Value, re: &Regex, replacement: &str) -> Value {
    match value {
        Value::String(s) => Value::String(re.replace_all(&s, replacement).into_owned()),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| redact(v, re, replacement))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, redact(v, re, replacement)))
                .collect(),
        ),
        other => other,
    }
}
