use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use weft_core::descriptor::{AgentDescriptor, ExecutorDescriptor, NodeTypeDescriptor};
use weft_core::error::{Result, WeftError};
use weft_core::types::{ExecutorBinding, ValueMap};

use crate::manifest::{PluginManifest, PluginMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EntryKind {
    NodeType,
    Executor,
    Agent,
}

/// Point-in-time view of every registered plugin.
///
/// Snapshots are immutable; mutation builds a new snapshot and swaps it in,
/// so a reader holding one sees a consistent table for as long as it keeps it.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    plugins: BTreeMap<String, PluginMetadata>,
    resources: HashMap<String, ValueMap>,
    node_types: BTreeMap<String, NodeTypeDescriptor>,
    executors: BTreeMap<String, ExecutorDescriptor>,
    agents: BTreeMap<String, AgentDescriptor>,
    // Plugin that declared each entry, keyed by (kind, id).
    owners: HashMap<(EntryKind, String), String>,
    // Derived indices, rebuilt by `reindex`.
    agents_by_type: HashMap<String, Vec<String>>,
    bindings: HashMap<String, ExecutorBinding>,
}

impl RegistrySnapshot {
    pub fn plugin(&self, id: &str) -> Option<&PluginMetadata> {
        self.plugins.get(id)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &PluginMetadata> {
        self.plugins.values()
    }

    pub fn resources(&self, plugin_id: &str) -> Option<&ValueMap> {
        self.resources.get(plugin_id)
    }

    pub fn node_type(&self, node_type: &str) -> Option<&NodeTypeDescriptor> {
        self.node_types.get(node_type)
    }

    pub fn node_types(&self) -> impl Iterator<Item = &NodeTypeDescriptor> {
        self.node_types.values()
    }

    pub fn executor(&self, id: &str) -> Option<&ExecutorDescriptor> {
        self.executors.get(id)
    }

    pub fn executors(&self) -> impl Iterator<Item = &ExecutorDescriptor> {
        self.executors.values()
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        self.agents.get(agent_id)
    }

    /// All agents, ordered by id.
    pub fn agents(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents.values()
    }

    pub fn agents_of_type(&self, agent_type: &str) -> Vec<&AgentDescriptor> {
        self.agents_by_type
            .get(agent_type)
            .map(|ids| ids.iter().filter_map(|id| self.agents.get(id)).collect())
            .unwrap_or_default()
    }

    /// Agents advertising `capability`, ordered by id.
    pub fn agents_with_capability(&self, capability: &str) -> Vec<&AgentDescriptor> {
        self.agents
            .values()
            .filter(|a| a.has_capability(capability))
            .collect()
    }

    /// Default binding for a node type, as resolved when the snapshot was built.
    pub fn default_binding(&self, node_type: &str) -> Option<&ExecutorBinding> {
        self.bindings.get(node_type)
    }

    /// Replace everything `plugin_id` declared before with `manifest`.
    fn insert_manifest(&mut self, manifest: PluginManifest) {
        let plugin_id = manifest.plugin.id.clone();
        self.remove_plugin_entries(&plugin_id);
        for nt in manifest.node_types {
            self.owners
                .insert((EntryKind::NodeType, nt.node_type.clone()), plugin_id.clone());
            self.node_types.insert(nt.node_type.clone(), nt);
        }
        for exec in manifest.executors {
            self.owners
                .insert((EntryKind::Executor, exec.id.clone()), plugin_id.clone());
            self.executors.insert(exec.id.clone(), exec);
        }
        for agent in manifest.agents {
            self.owners
                .insert((EntryKind::Agent, agent.agent_id.clone()), plugin_id.clone());
            self.agents.insert(agent.agent_id.clone(), agent);
        }
        self.resources.insert(plugin_id.clone(), manifest.resources);
        self.plugins.insert(plugin_id, manifest.plugin);
    }

    fn remove_plugin_entries(&mut self, plugin_id: &str) {
        let owned: Vec<(EntryKind, String)> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == plugin_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in owned {
            match key.0 {
                EntryKind::NodeType => {
                    self.node_types.remove(&key.1);
                }
                EntryKind::Executor => {
                    self.executors.remove(&key.1);
                }
                EntryKind::Agent => {
                    self.agents.remove(&key.1);
                }
            }
            self.owners.remove(&key);
        }
    }

    /// Fail on any reference to an executor id the snapshot does not know.
    fn check_references(&self) -> Result<()> {
        for nt in self.node_types.values() {
            if let Some(exec) = &nt.default_executor {
                if !self.executors.contains_key(exec) {
                    return Err(WeftError::validation(format!(
                        "node type '{}' references unknown executor '{}'",
                        nt.node_type, exec
                    )));
                }
            }
        }
        for agent in self.agents.values() {
            if !self.executors.contains_key(&agent.executor) {
                return Err(WeftError::validation(format!(
                    "agent '{}' references unknown executor '{}'",
                    agent.agent_id, agent.executor
                )));
            }
        }
        Ok(())
    }

    fn reindex(&mut self) {
        let mut by_type: HashMap<String, Vec<String>> = HashMap::new();
        for agent in self.agents.values() {
            by_type
                .entry(agent.agent_type.clone())
                .or_default()
                .push(agent.agent_id.clone());
        }
        self.agents_by_type = by_type;

        self.bindings = self
            .node_types
            .values()
            .filter_map(|nt| {
                let exec = self.executors.get(nt.default_executor.as_ref()?)?;
                Some((nt.node_type.clone(), exec.binding()))
            })
            .collect();
    }
}

/// Process-wide table of node types, executors and agents.
///
/// Reads are lock-free against the current snapshot. Writers serialize on a
/// mutex, build a new snapshot and swap it in atomically.
pub struct PluginRegistry {
    current: ArcSwap<RegistrySnapshot>,
    write_lock: Mutex<()>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::new(Arc::new(RegistrySnapshot::default())),
            write_lock: Mutex::new(()),
        }
    }

    /// Build a registry from a set of manifests.
    ///
    /// Fails fast when two plugins declare the same node type, executor or
    /// agent id, or when any descriptor references an unknown executor.
    pub fn build(manifests: Vec<PluginManifest>) -> Result<Self> {
        let mut owners: HashMap<(&'static str, String), String> = HashMap::new();
        for manifest in &manifests {
            let plugin = manifest.id();
            let ids = manifest
                .node_types
                .iter()
                .map(|n| ("node type", n.node_type.clone()))
                .chain(manifest.executors.iter().map(|e| ("executor", e.id.clone())))
                .chain(manifest.agents.iter().map(|a| ("agent", a.agent_id.clone())));
            for key in ids {
                if let Some(prev) = owners.get(&key) {
                    if prev != plugin {
                        return Err(WeftError::validation(format!(
                            "duplicate {} '{}' declared by plugins '{}' and '{}'",
                            key.0, key.1, prev, plugin
                        )));
                    }
                }
                owners.insert(key, plugin.to_string());
            }
        }

        let mut snapshot = RegistrySnapshot::default();
        for manifest in manifests {
            snapshot.insert_manifest(manifest);
        }
        snapshot.check_references()?;
        snapshot.reindex();

        info!(
            plugins = snapshot.plugins.len(),
            node_types = snapshot.node_types.len(),
            executors = snapshot.executors.len(),
            agents = snapshot.agents.len(),
            "Plugin registry built"
        );

        Ok(Self {
            current: ArcSwap::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
        })
    }

    /// Current point-in-time view.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RegistrySnapshot) -> Result<()>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (**self.current.load()).clone();
        mutate(&mut next)?;
        next.check_references()?;
        next.reindex();
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// Register (or re-register) a plugin. A re-registered plugin replaces
    /// everything its previous manifest declared, so entries it dropped stop
    /// resolving. The swap is rejected if it would leave a dangling executor
    /// reference.
    pub fn register(&self, manifest: PluginManifest) -> Result<()> {
        let id = manifest.id().to_string();
        self.update(|snap| {
            snap.insert_manifest(manifest);
            Ok(())
        })?;
        info!(plugin = %id, "Plugin registered");
        Ok(())
    }

    pub fn register_node_type(&self, descriptor: NodeTypeDescriptor) -> Result<()> {
        self.update(|snap| {
            snap.node_types.insert(descriptor.node_type.clone(), descriptor);
            Ok(())
        })
    }

    pub fn register_executor(&self, descriptor: ExecutorDescriptor) -> Result<()> {
        debug!(executor = %descriptor.id, "Executor registered");
        self.update(|snap| {
            snap.executors.insert(descriptor.id.clone(), descriptor);
            Ok(())
        })
    }

    pub fn register_agent(&self, agent: AgentDescriptor) -> Result<()> {
        let id = agent.agent_id.clone();
        self.update(|snap| {
            snap.agents.insert(agent.agent_id.clone(), agent);
            Ok(())
        })?;
        info!(agent = %id, "Agent registered");
        Ok(())
    }

    /// Remove an agent. Returns whether it was present.
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let mut removed = false;
        let result = self.update(|snap| {
            removed = snap.agents.remove(agent_id).is_some();
            Ok(())
        });
        if result.is_ok() && removed {
            info!(agent = %agent_id, "Agent deregistered");
        }
        removed
    }

    /// Resolve the executor binding for a node.
    ///
    /// A per-instance override wins; otherwise the node type's default
    /// executor is used. Resolution against one snapshot is deterministic.
    pub fn resolve_binding(
        &self,
        node_type: &str,
        override_binding: Option<&ExecutorBinding>,
    ) -> Result<ExecutorBinding> {
        resolve_in(&self.snapshot(), node_type, override_binding)
    }
}

/// Resolve a binding against an explicit snapshot.
pub fn resolve_in(
    snapshot: &RegistrySnapshot,
    node_type: &str,
    override_binding: Option<&ExecutorBinding>,
) -> Result<ExecutorBinding> {
    if let Some(binding) = override_binding {
        return Ok(binding.clone());
    }
    if let Some(binding) = snapshot.default_binding(node_type) {
        return Ok(binding.clone());
    }
    match snapshot.node_type(node_type) {
        Some(_) => Err(WeftError::validation(format!(
            "node type '{}' has no default executor",
            node_type
        ))),
        None => Err(WeftError::validation(format!(
            "unknown node type '{}'",
            node_type
        ))),
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::Protocol;

    fn agent(id: &str, agent_type: &str, caps: &[&str], executor: &str) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: id.into(),
            agent_type: agent_type.into(),
            name: None,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            executor: executor.into(),
        }
    }

    fn llm_plugin() -> PluginManifest {
        let mut nt = NodeTypeDescriptor::builtin("llm_call", false);
        nt.default_executor = Some("llm".into());
        PluginManifest::new("core-llm")
            .with_node_type(nt)
            .with_executor(ExecutorDescriptor::inproc("llm"))
            .with_agent(agent("writer", "llm", &["write"], "llm"))
    }

    #[test]
    fn build_indexes_and_resolves() {
        let registry = PluginRegistry::build(vec![llm_plugin()]).unwrap();
        let binding = registry.resolve_binding("llm_call", None).unwrap();
        assert_eq!(binding.executor_id, "llm");
        assert_eq!(binding.protocol, Protocol::Inproc);

        let snap = registry.snapshot();
        assert_eq!(snap.agents_of_type("llm").len(), 1);
        assert_eq!(snap.agents_with_capability("write")[0].agent_id, "writer");
        assert!(snap.resources("core-llm").is_some());
    }

    #[test]
    fn override_wins() {
        let registry = PluginRegistry::build(vec![llm_plugin()]).unwrap();
        let custom = ExecutorBinding::inproc("other");
        let binding = registry.resolve_binding("llm_call", Some(&custom)).unwrap();
        assert_eq!(binding.executor_id, "other");
    }

    #[test]
    fn dangling_executor_fails_fast() {
        let mut nt = NodeTypeDescriptor::builtin("ghost", false);
        nt.default_executor = Some("missing".into());
        let err = PluginRegistry::build(vec![PluginManifest::new("p").with_node_type(nt)])
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown executor 'missing'"));
    }

    #[test]
    fn duplicate_ids_across_plugins_fail() {
        let a = PluginManifest::new("a").with_executor(ExecutorDescriptor::inproc("shared"));
        let b = PluginManifest::new("b").with_executor(ExecutorDescriptor::inproc("shared"));
        let err = PluginRegistry::build(vec![a, b]).err().unwrap();
        assert!(err.to_string().contains("duplicate executor 'shared'"));
    }

    #[test]
    fn reregister_overwrites() {
        let registry = PluginRegistry::build(vec![llm_plugin()]).unwrap();
        let mut exec = ExecutorDescriptor::inproc("llm");
        exec.timeout_ms = Some(500);
        let mut nt = NodeTypeDescriptor::builtin("llm_call", false);
        nt.default_executor = Some("llm".into());
        registry
            .register(PluginManifest::new("core-llm").with_node_type(nt).with_executor(exec))
            .unwrap();
        let binding = registry.resolve_binding("llm_call", None).unwrap();
        assert_eq!(binding.config_u64("timeout_ms"), Some(500));
    }

    #[test]
    fn reregister_drops_entries_the_new_manifest_omits() {
        let registry = PluginRegistry::build(vec![llm_plugin()]).unwrap();
        let mut nt = NodeTypeDescriptor::builtin("chat", false);
        nt.default_executor = Some("llm-v2".into());
        registry
            .register(
                PluginManifest::new("core-llm")
                    .with_node_type(nt)
                    .with_executor(ExecutorDescriptor::inproc("llm-v2")),
            )
            .unwrap();

        let snap = registry.snapshot();
        assert!(snap.node_type("llm_call").is_none());
        assert!(snap.executor("llm").is_none());
        assert!(snap.agent("writer").is_none());
        assert!(registry.resolve_binding("llm_call", None).is_err());
        assert_eq!(
            registry.resolve_binding("chat", None).unwrap().executor_id,
            "llm-v2"
        );
    }

    #[test]
    fn reregister_keeps_other_plugins() {
        let registry = PluginRegistry::build(vec![llm_plugin()]).unwrap();
        registry
            .register(PluginManifest::new("tools").with_executor(ExecutorDescriptor::inproc("shell")))
            .unwrap();
        registry
            .register(PluginManifest::new("tools").with_executor(ExecutorDescriptor::inproc("http")))
            .unwrap();

        let snap = registry.snapshot();
        assert!(snap.executor("shell").is_none());
        assert!(snap.executor("http").is_some());
        assert!(snap.executor("llm").is_some());
        assert!(registry.resolve_binding("llm_call", None).is_ok());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let registry = PluginRegistry::build(vec![llm_plugin()]).unwrap();
        let before = registry.snapshot();
        registry
            .register_agent(agent("critic", "llm", &["review"], "llm"))
            .unwrap();
        assert!(before.agent("critic").is_none());
        assert!(registry.snapshot().agent("critic").is_some());

        assert!(registry.deregister_agent("critic"));
        assert!(!registry.deregister_agent("critic"));
        assert!(registry.snapshot().agent("critic").is_none());
    }

    #[test]
    fn rejected_update_leaves_registry_untouched() {
        let registry = PluginRegistry::build(vec![llm_plugin()]).unwrap();
        let err = registry
            .register_agent(agent("lost", "llm", &[], "nowhere"))
            .unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
        assert!(registry.snapshot().agent("lost").is_none());
    }

    #[test]
    fn unknown_node_type() {
        let registry = PluginRegistry::new();
        assert!(registry.resolve_binding("nope", None).is_err());
    }
}
