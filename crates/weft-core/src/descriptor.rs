use serde::{Deserialize, Serialize};

use crate::types::{ExecutionMode, ExecutorBinding, Protocol, ValueMap};

/// Declared port on a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Schema-level description of a node type, as published by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeDescriptor {
    pub node_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Executor id used when a node instance carries no binding override.
    #[serde(default)]
    pub default_executor: Option<String>,
    /// Whether instances may suspend into a checkpoint.
    #[serde(default)]
    pub checkpointable: bool,
    #[serde(default)]
    pub inputs: Vec<PortDescriptor>,
    #[serde(default)]
    pub outputs: Vec<PortDescriptor>,
}

impl NodeTypeDescriptor {
    /// Descriptor for a node type the engine handles itself.
    pub fn builtin(node_type: &str, checkpointable: bool) -> Self {
        Self {
            node_type: node_type.to_string(),
            label: None,
            description: None,
            default_executor: None,
            checkpointable,
            inputs: vec![],
            outputs: vec![],
        }
    }
}

/// An executor a plugin makes available for binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorDescriptor {
    pub id: String,
    #[serde(default = "default_executor_type")]
    pub executor_type: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub config: ValueMap,
    /// Per-executor SYNC deadline, overriding the router default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_executor_type() -> String {
    "inproc".to_string()
}

impl ExecutorDescriptor {
    pub fn inproc(id: &str) -> Self {
        Self {
            id: id.to_string(),
            executor_type: default_executor_type(),
            mode: ExecutionMode::Sync,
            protocol: Protocol::Inproc,
            config: ValueMap::new(),
            timeout_ms: None,
        }
    }

    /// The binding a node of this executor resolves to.
    pub fn binding(&self) -> ExecutorBinding {
        let mut config = self.config.clone();
        if let Some(ms) = self.timeout_ms {
            config
                .entry("timeout_ms".to_string())
                .or_insert_with(|| serde_json::Value::from(ms));
        }
        ExecutorBinding {
            executor_type: self.executor_type.clone(),
            executor_id: self.id.clone(),
            mode: self.mode,
            protocol: self.protocol,
            config,
        }
    }
}

/// Agent identity and the capabilities it advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Executor id the agent's work is dispatched to.
    pub executor: String,
}

impl AgentDescriptor {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}
