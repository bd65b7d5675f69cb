use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Map of named JSON values (run variables, node config, ports).
pub type ValueMap = serde_json::Map<String, serde_json::Value>;

/// Unique identifier of a workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Statuses only move forward; `Suspended -> Running` is the single
    /// re-entry and `Cancelled` is reachable from every non-terminal state.
    /// `Suspended -> Failed` covers an expired human-review timeout.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Running) | (Pending, Skipped) => true,
            (Running, Suspended) | (Running, Completed) | (Running, Failed) => true,
            (Suspended, Running) | (Suspended, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal (or parked) status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How an executor call behaves with respect to the dispatching worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
    Stream,
}

/// Transport family behind an executor binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Grpc,
    Kafka,
    Rest,
    #[default]
    Inproc,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Grpc => "grpc",
            Self::Kafka => "kafka",
            Self::Rest => "rest",
            Self::Inproc => "inproc",
        };
        f.write_str(s)
    }
}

/// Indirection describing how and where a node type is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorBinding {
    pub executor_type: String,
    pub executor_id: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub config: ValueMap,
}

impl ExecutorBinding {
    /// Binding to a trusted local executor.
    pub fn inproc(executor_id: impl Into<String>) -> Self {
        Self {
            executor_type: "inproc".to_string(),
            executor_id: executor_id.into(),
            mode: ExecutionMode::Sync,
            protocol: Protocol::Inproc,
            config: ValueMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Read a string value from the binding config.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Read an unsigned integer from the binding config.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }
}

/// Single-use capability proving the right to execute or resume one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionToken {
    pub run_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

impl ExecutionToken {
    pub fn mint(run_id: &RunId, node_id: &str, attempt: u32, ttl: Duration) -> Self {
        Self {
            run_id: run_id.0.clone(),
            node_id: node_id.to_string(),
            attempt,
            nonce: Uuid::new_v4().to_string(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Resume information handed to a checkpointable executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeContext {
    pub state_tag: String,
    pub awaiting: serde_json::Value,
    pub decision: serde_json::Value,
}

/// Everything an executor sees about the node it is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeContext {
    pub run_id: String,
    pub node_id: String,
    pub node_type: String,
    pub attempt: u32,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub config: ValueMap,
    #[serde(default)]
    pub resume: Option<ResumeContext>,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(run_id: impl Into<String>, node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            node_type: node_type.into(),
            attempt: 1,
            inputs: HashMap::new(),
            config: ValueMap::new(),
            resume: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, serde_json::Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn input(&self, key: &str) -> Option<&serde_json::Value> {
        self.inputs.get(key)
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(|v| v.as_str())
    }

    /// Inputs as a single JSON object.
    pub fn inputs_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// What an executor produced for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The node finished with an output value.
    Completed { output: serde_json::Value },
    /// The node asks to be parked until an external resume event.
    Suspend {
        state_tag: String,
        awaiting: serde_json::Value,
    },
}

impl ExecutionOutcome {
    pub fn completed(output: serde_json::Value) -> Self {
        Self::Completed { output }
    }

    pub fn suspend(state_tag: impl Into<String>, awaiting: serde_json::Value) -> Self {
        Self::Suspend {
            state_tag: state_tag.into(),
            awaiting,
        }
    }
}

/// One element of a STREAM execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamChunk {
    Partial(serde_json::Value),
    Final(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use NodeStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Suspended.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert!(!Skipped.can_transition_to(Running));
    }

    #[test]
    fn binding_defaults_from_json() {
        let binding: ExecutorBinding = serde_json::from_value(serde_json::json!({
            "executor_type": "http",
            "executor_id": "summarizer",
            "protocol": "rest",
            "config": {"url": "http://localhost:9000", "timeout_ms": 2000}
        }))
        .unwrap();
        assert_eq!(binding.mode, ExecutionMode::Sync);
        assert_eq!(binding.protocol, Protocol::Rest);
        assert_eq!(binding.config_str("url"), Some("http://localhost:9000"));
        assert_eq!(binding.config_u64("timeout_ms"), Some(2000));
    }

    #[test]
    fn token_expiry() {
        let run = RunId::new();
        let live = ExecutionToken::mint(&run, "n1", 1, Duration::seconds(60));
        assert!(!live.is_expired());
        let dead = ExecutionToken::mint(&run, "n1", 1, Duration::seconds(-1));
        assert!(dead.is_expired());
        assert_ne!(live.nonce, dead.nonce);
    }
}
