//! Workflow graph model: nodes, guarded edges and input bindings.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::error::{ErrorKind, Result, WeftError};
use weft_core::expression::{lookup_path, ExpressionCache};
use weft_core::types::{ExecutorBinding, ValueMap};

/// One configured step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: String,
    pub node_type: String,
    /// Descriptor id/version the node was authored against.
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub config: ValueMap,
    #[serde(default)]
    pub inputs: Vec<Binding>,
    /// Shape the raw executor output into named fields.
    #[serde(default)]
    pub outputs: Vec<Binding>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// UI placement, carried but never read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    /// Per-instance executor override.
    #[serde(default)]
    pub executor: Option<ExecutorBinding>,
}

impl NodeInstance {
    pub fn new(id: &str, node_type: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            descriptor: None,
            config: ValueMap::new(),
            inputs: vec![],
            outputs: vec![],
            capabilities: vec![],
            position: None,
            executor: None,
        }
    }

    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_input(mut self, binding: Binding) -> Self {
        self.inputs.push(binding);
        self
    }

    pub fn with_output(mut self, binding: Binding) -> Self {
        self.outputs.push(binding);
        self
    }

    pub fn with_executor(mut self, binding: ExecutorBinding) -> Self {
        self.executor = Some(binding);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    /// Dotted path into the run variables.
    Variable,
    /// `node_id` or `node_id.path` into a completed node's output.
    NodeOutput,
    Literal,
}

/// Declarative rule for sourcing one input value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub kind: BindingKind,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub value: Option<Value>,
    /// Expression evaluated over the node's gathered values, with this
    /// binding's raw value available as `value`.
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Binding {
    pub fn variable(name: &str, path: &str) -> Self {
        Self::new(name, BindingKind::Variable, path, None)
    }

    pub fn node_output(name: &str, source: &str) -> Self {
        Self::new(name, BindingKind::NodeOutput, source, None)
    }

    pub fn literal(name: &str, value: Value) -> Self {
        Self::new(name, BindingKind::Literal, "", Some(value))
    }

    fn new(name: &str, kind: BindingKind, source: &str, value: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            source: source.to_string(),
            value,
            transform: None,
            required: true,
        }
    }

    pub fn with_transform(mut self, expr: &str) -> Self {
        self.transform = Some(expr.to_string());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Normal,
    /// Taken when no guarded edge matches.
    Default,
    /// Taken when the source fails, optionally only for one error kind.
    Error {
        #[serde(default)]
        on: Option<ErrorKind>,
    },
}

/// Directed, optionally guarded transition between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    /// Output field carried along the edge; the whole output when unset.
    #[serde(default)]
    pub source_port: Option<String>,
    pub target: String,
    /// Input name the carried value lands in. When unset, object values are
    /// merged into the target's inputs and anything else lands in `input`.
    #[serde(default)]
    pub target_port: Option<String>,
    #[serde(default)]
    pub guard: Option<String>,
    /// Higher is evaluated first; declaration order breaks ties.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            id: String::new(),
            source: source.to_string(),
            source_port: None,
            target: target.to_string(),
            target_port: None,
            guard: None,
            priority: 0,
            kind: EdgeKind::Normal,
        }
    }

    pub fn guarded(source: &str, target: &str, guard: &str) -> Self {
        let mut edge = Self::new(source, target);
        edge.guard = Some(guard.to_string());
        edge
    }

    pub fn default_route(source: &str, target: &str) -> Self {
        let mut edge = Self::new(source, target);
        edge.kind = EdgeKind::Default;
        edge
    }

    pub fn on_error(source: &str, target: &str, on: Option<ErrorKind>) -> Self {
        let mut edge = Self::new(source, target);
        edge.kind = EdgeKind::Error { on };
        edge
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ports(mut self, source_port: Option<&str>, target_port: Option<&str>) -> Self {
        self.source_port = source_port.map(str::to_string);
        self.target_port = target_port.map(str::to_string);
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, EdgeKind::Error { .. })
    }

    /// Value carried to the target when this edge is taken after success.
    pub fn carried(&self, output: &Value) -> Value {
        match (&self.source_port, output) {
            (Some(port), Value::Object(map)) => {
                lookup_path(map, port).unwrap_or(Value::Null)
            }
            (Some(_), _) => Value::Null,
            (None, v) => v.clone(),
        }
    }
}

/// An authored workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<NodeInstance>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Default run variables; overridden by those passed at start.
    #[serde(default)]
    pub variables: ValueMap,
    /// Nested graphs referenced by loop bodies.
    #[serde(default)]
    pub subgraphs: Vec<WorkflowGraph>,
}

impl WorkflowGraph {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            nodes: vec![],
            edges: vec![],
            variables: ValueMap::new(),
            subgraphs: vec![],
        }
    }

    pub fn node(mut self, node: NodeInstance) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn subgraph(mut self, graph: WorkflowGraph) -> Self {
        self.subgraphs.push(graph);
        self
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| WeftError::validation(format!("workflow: {}", e)))
    }
}

/// Validated, indexed, immutable view of a workflow used by one or more runs.
#[derive(Debug)]
pub struct GraphModel {
    graph: WorkflowGraph,
    index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    order: Vec<String>,
}

impl GraphModel {
    /// Validate and index a workflow.
    ///
    /// Fails with `Validation` on duplicate node ids, edges to unknown nodes,
    /// cycles, literal bindings without a value, output bindings that
    /// reference unknown nodes and input bindings that read a node which is
    /// not upstream.
    pub fn new(mut graph: WorkflowGraph) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(WeftError::validation(format!(
                    "duplicate node id '{}' in graph '{}'",
                    node.id, graph.id
                )));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in graph.edges.iter_mut().enumerate() {
            for end in [&edge.source, &edge.target] {
                if !index.contains_key(end) {
                    return Err(WeftError::validation(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
            if edge.id.is_empty() {
                edge.id = format!("{}->{}#{}", edge.source, edge.target, i);
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
            incoming.entry(edge.target.clone()).or_default().push(i);
        }
        // Evaluation order: priority descending, stable on declaration.
        for list in outgoing.values_mut() {
            list.sort_by(|a, b| graph.edges[*b].priority.cmp(&graph.edges[*a].priority));
        }

        let order = topological_order(&graph, &incoming, &outgoing)?;

        for node in &graph.nodes {
            let bindings = node
                .inputs
                .iter()
                .map(|b| (b, true))
                .chain(node.outputs.iter().map(|b| (b, false)));
            for (binding, is_input) in bindings {
                match binding.kind {
                    BindingKind::Literal if binding.value.is_none() => {
                        return Err(WeftError::validation(format!(
                            "literal binding '{}' on node '{}' has no value",
                            binding.name, node.id
                        )))
                    }
                    BindingKind::NodeOutput => {
                        let source = binding.source.split('.').next().unwrap_or_default();
                        if !index.contains_key(source) {
                            return Err(WeftError::validation(format!(
                                "binding '{}' on node '{}' references unknown node '{}'",
                                binding.name, node.id, source
                            )));
                        }
                        // An input may only read an output that exists by the
                        // time the node is dispatched.
                        if is_input && !upstream_of(&graph, &incoming, &node.id).contains(source) {
                            return Err(WeftError::validation(format!(
                                "binding '{}' on node '{}' reads node '{}', which is not upstream",
                                binding.name, node.id, source
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            graph,
            index,
            outgoing,
            incoming,
            order,
        })
    }

    pub fn id(&self) -> &str {
        &self.graph.id
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn node(&self, id: &str) -> Option<&NodeInstance> {
        self.index.get(id).map(|i| &self.graph.nodes[*i])
    }

    pub fn nodes(&self) -> &[NodeInstance] {
        &self.graph.nodes
    }

    pub fn edge(&self, idx: usize) -> &Edge {
        &self.graph.edges[idx]
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edges.len()
    }

    /// Outgoing edge indices in evaluation order.
    pub fn outgoing(&self, id: &str) -> &[usize] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, id: &str) -> &[usize] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes without incoming edges, in declaration order.
    pub fn entry_nodes(&self) -> Vec<&str> {
        self.graph
            .nodes
            .iter()
            .filter(|n| self.incoming(&n.id).is_empty())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Nodes without outgoing edges, in declaration order.
    pub fn sink_nodes(&self) -> Vec<&str> {
        self.graph
            .nodes
            .iter()
            .filter(|n| self.outgoing(&n.id).is_empty())
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Resolve a node's inputs.
    ///
    /// `base` holds the values carried by taken incoming edges (or the run
    /// variables for entry nodes). Bindings are gathered over it, then each
    /// transformer runs against the gathered values.
    pub fn resolve_inputs(
        &self,
        node: &NodeInstance,
        variables: &ValueMap,
        outputs: &HashMap<String, Value>,
        base: ValueMap,
        exprs: &ExpressionCache,
    ) -> Result<ValueMap> {
        let mut gathered = base;
        for binding in &node.inputs {
            match gather(binding, &node.id, variables, outputs)? {
                Some(v) => {
                    gathered.insert(binding.name.clone(), v);
                }
                None => {
                    gathered.remove(&binding.name);
                }
            }
        }
        apply_transforms(&node.inputs, gathered, exprs)
    }

    /// Shape a node's raw output through its output bindings.
    ///
    /// Output bindings see the raw output as `output` and, for object
    /// outputs, its fields at top level. Without output bindings the raw
    /// output is returned unchanged.
    pub fn shape_output(node: &NodeInstance, raw: Value, exprs: &ExpressionCache) -> Result<Value> {
        if node.outputs.is_empty() {
            return Ok(raw);
        }
        let mut scope = match &raw {
            Value::Object(map) => map.clone(),
            _ => ValueMap::new(),
        };
        scope.insert("output".to_string(), raw);
        let empty = HashMap::new();
        let mut shaped = ValueMap::new();
        for binding in &node.outputs {
            if let Some(v) = gather(binding, &node.id, &scope, &empty)? {
                shaped.insert(binding.name.clone(), v);
            }
        }
        let shaped = apply_transforms(&node.outputs, shaped, exprs)?;
        Ok(Value::Object(shaped))
    }

    /// Select the outgoing edges taken after a node completed.
    ///
    /// When none of the node's normal edges is guarded they are all taken.
    /// Otherwise the first edge in priority order whose guard holds (or
    /// that has no guard) is taken, then any default edge. No match and no
    /// default is a routing error.
    pub fn select_edges(
        &self,
        node_id: &str,
        guard_vars: &ValueMap,
        exprs: &ExpressionCache,
    ) -> Result<Vec<usize>> {
        let out = self.outgoing(node_id);
        let normal: Vec<usize> = out
            .iter()
            .copied()
            .filter(|i| self.graph.edges[*i].kind == EdgeKind::Normal)
            .collect();
        let defaults: Vec<usize> = out
            .iter()
            .copied()
            .filter(|i| self.graph.edges[*i].kind == EdgeKind::Default)
            .collect();

        let guarded = normal.iter().any(|i| self.graph.edges[*i].guard.is_some());
        if !guarded && defaults.is_empty() {
            return Ok(normal);
        }

        for i in &normal {
            let edge = &self.graph.edges[*i];
            let matched = match &edge.guard {
                None => true,
                Some(guard) => exprs.evaluate_bool(guard, guard_vars)?,
            };
            if matched {
                return Ok(vec![*i]);
            }
        }
        if !defaults.is_empty() {
            return Ok(defaults);
        }
        if normal.is_empty() {
            return Ok(vec![]);
        }
        Err(WeftError::Routing {
            node: node_id.to_string(),
        })
    }

    /// Error-handler edges that accept a failure of `kind`.
    pub fn error_edges(&self, node_id: &str, kind: ErrorKind) -> Vec<usize> {
        self.outgoing(node_id)
            .iter()
            .copied()
            .filter(|i| match &self.graph.edges[*i].kind {
                EdgeKind::Error { on } => on.map(|k| k == kind).unwrap_or(true),
                _ => false,
            })
            .collect()
    }
}

fn gather(
    binding: &Binding,
    node_id: &str,
    variables: &ValueMap,
    outputs: &HashMap<String, Value>,
) -> Result<Option<Value>> {
    let found = match binding.kind {
        BindingKind::Literal => {
            let value = binding.value.clone().ok_or_else(|| {
                WeftError::validation(format!(
                    "literal binding '{}' on node '{}' has no value",
                    binding.name, node_id
                ))
            })?;
            return Ok(Some(value));
        }
        BindingKind::Variable => lookup_path(variables, &binding.source),
        BindingKind::NodeOutput => {
            let (node, path) = match binding.source.split_once('.') {
                Some((n, p)) => (n, Some(p)),
                None => (binding.source.as_str(), None),
            };
            outputs.get(node).and_then(|out| match (path, out) {
                (None, v) => Some(v.clone()),
                (Some(p), Value::Object(map)) => lookup_path(map, p),
                (Some(_), _) => None,
            })
        }
    };
    match found {
        Some(v) => Ok(Some(v)),
        None if binding.required => Err(WeftError::binding(
            node_id,
            format!("missing source '{}' for input '{}'", binding.source, binding.name),
        )),
        None => Ok(None),
    }
}

fn apply_transforms(
    bindings: &[Binding],
    gathered: ValueMap,
    exprs: &ExpressionCache,
) -> Result<ValueMap> {
    let mut resolved = gathered.clone();
    for binding in bindings {
        let Some(expr) = &binding.transform else { continue };
        let mut scope = gathered.clone();
        scope.insert(
            "value".to_string(),
            gathered.get(&binding.name).cloned().unwrap_or(Value::Null),
        );
        resolved.insert(binding.name.clone(), exprs.evaluate(expr, &scope)?);
    }
    Ok(resolved)
}

/// Every node with a path to `node_id`.
fn upstream_of<'a>(
    graph: &'a WorkflowGraph,
    incoming: &HashMap<String, Vec<usize>>,
    node_id: &str,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack = vec![node_id.to_string()];
    while let Some(id) = stack.pop() {
        for edge_idx in incoming.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            let source = graph.edges[*edge_idx].source.as_str();
            if seen.insert(source) {
                stack.push(source.to_string());
            }
        }
    }
    seen
}

/// Kahn's algorithm; any node left over sits on a cycle.
fn topological_order(
    graph: &WorkflowGraph,
    incoming: &HashMap<String, Vec<usize>>,
    outgoing: &HashMap<String, Vec<usize>>,
) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), incoming.get(&n.id).map(Vec::len).unwrap_or(0)))
        .collect();
    let mut queue: VecDeque<&str> = graph
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(graph.nodes.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for edge_idx in outgoing.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            let target = graph.edges[*edge_idx].target.as_str();
            if let Some(d) = in_degree.get_mut(target) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    if order.len() != graph.nodes.len() {
        let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut cyclic: Vec<&str> = graph
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !placed.contains(id))
            .collect();
        cyclic.sort();
        return Err(WeftError::validation(format!(
            "graph '{}' has a cycle through: {}",
            graph.id,
            cyclic.join(", ")
        )));
    }
    Ok(order)
}
