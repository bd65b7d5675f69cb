use serde::{Deserialize, Serialize};

/// When a policy is evaluated relative to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPhase {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// What happens when a policy expression evaluates true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyAction {
    /// Block the node.
    Deny,
    /// Rewrite matching text in string leaves of the payload.
    Redact { pattern: String, replacement: String },
    /// Record the trigger and let the node through.
    Audit,
}

impl Default for PolicyAction {
    fn default() -> Self {
        Self::Deny
    }
}

/// A guardrail policy. `expression` is a boolean expression that is true
/// when the policy triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub expression: String,
    #[serde(default)]
    pub deny_message: String,
    #[serde(default)]
    pub severity: Severity,
    pub phase: PolicyPhase,
    #[serde(default)]
    pub action: PolicyAction,
    /// Node types the policy is scoped to; empty applies to all.
    #[serde(default)]
    pub applies_to: Vec<String>,
}

impl Policy {
    pub fn deny(id: &str, phase: PolicyPhase, expression: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            expression: expression.to_string(),
            deny_message: message.to_string(),
            severity: Severity::High,
            phase,
            action: PolicyAction::Deny,
            applies_to: vec![],
        }
    }

    pub fn redact(id: &str, expression: &str, pattern: &str, replacement: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            expression: expression.to_string(),
            deny_message: String::new(),
            severity: Severity::Medium,
            phase: PolicyPhase::Post,
            action: PolicyAction::Redact {
                pattern: pattern.to_string(),
                replacement: replacement.to_string(),
            },
            applies_to: vec![],
        }
    }

    pub fn applies_to_type(&self, node_type: &str) -> bool {
        self.applies_to.is_empty() || self.applies_to.iter().any(|t| t == node_type)
    }
}

/// Outcome of a guardrail check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub triggered: Vec<String>,
    pub redacted: Option<serde_json::Value>,
}

impl GuardrailResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            triggered: vec![],
            redacted: None,
        }
    }

    pub fn is_redacted(&self) -> bool {
        self.redacted.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_from_toml() {
        let policy: Policy = toml::from_str(
            r#"
id = "pii"
expression = "text matches '[a-z]+@[a-z]+'"
phase = "post"
[action]
type = "redact"
pattern = "[a-z]+@[a-z]+"
replacement = "[email]"
"#,
        )
        .unwrap();
        assert_eq!(policy.phase, PolicyPhase::Post);
        assert_eq!(policy.severity, Severity::Medium);
        assert!(matches!(policy.action, PolicyAction::Redact { .. }));
        assert!(policy.applies_to_type("anything"));
    }
}
