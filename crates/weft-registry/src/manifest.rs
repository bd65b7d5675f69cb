use std::path::Path;

use serde::{Deserialize, Serialize};

use weft_core::descriptor::{AgentDescriptor, ExecutorDescriptor, NodeTypeDescriptor};
use weft_core::error::{Result, WeftError};
use weft_core::types::ValueMap;

/// Plugin metadata block (`[plugin]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique plugin id (e.g., "core-llm").
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// Declarative plugin manifest.
///
/// Bundles node-type descriptors, executor descriptors, agent identities
/// and a free-form shared resource block. Accepted as TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMetadata,
    #[serde(default)]
    pub node_types: Vec<NodeTypeDescriptor>,
    #[serde(default)]
    pub executors: Vec<ExecutorDescriptor>,
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
    #[serde(default)]
    pub resources: ValueMap,
}

impl PluginManifest {
    pub fn new(id: &str) -> Self {
        Self {
            plugin: PluginMetadata {
                id: id.to_string(),
                name: None,
                version: default_version(),
                description: None,
            },
            node_types: vec![],
            executors: vec![],
            agents: vec![],
            resources: ValueMap::new(),
        }
    }

    pub fn with_node_type(mut self, node_type: NodeTypeDescriptor) -> Self {
        self.node_types.push(node_type);
        self
    }

    pub fn with_executor(mut self, executor: ExecutorDescriptor) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn with_agent(mut self, agent: AgentDescriptor) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WeftError::validation(format!("manifest: {}", e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| WeftError::validation(format!("manifest: {}", e)))
    }

    /// Parse a manifest file, choosing the format by extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    pub fn id(&self) -> &str {
        &self.plugin.id
    }
}
