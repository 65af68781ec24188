//! JSON form of a [`Graph`].
//!
//! Links address values as `inputs.NAME`, `NODE.SLOT` and `outputs.NAME`.
//! A link may carry a third element holding its region markers.

use crate::core::op::Attrs;
use crate::core::types::{DataType, Port, TensorType};
use crate::ir::infer::infer_types;
use crate::ir::{Boundary, Graph, NodeKind, ValueRef};
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConstantDef {
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dtype: DataType,
    pub values: Vec<f32>,
}

fn one() -> usize {
    1
}

fn is_one(n: &usize) -> bool {
    *n == 1
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    #[serde(default = "one", skip_serializing_if = "is_one")]
    pub outputs: usize,
    /// Backend the node is pinned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<ConstantDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<TensorType>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum LinkDef {
    Marked(String, String, Boundary),
    Plain(String, String),
}

impl LinkDef {
    pub fn endpoints(&self) -> (&str, &str) {
        match self {
            LinkDef::Marked(src, dst, _) | LinkDef::Plain(src, dst) => (src, dst),
        }
    }

    pub fn boundary(&self) -> Boundary {
        match self {
            LinkDef::Marked(_, _, b) => b.clone(),
            LinkDef::Plain(..) => Boundary::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GraphDef {
    #[serde(default)]
    pub name: String,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub links: Vec<LinkDef>,
}

impl GraphDef {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Serializes `graph`, listing nodes in topological order. Output ports
    /// get the inferred type of the value they consume.
    pub fn from_graph(graph: &Graph) -> anyhow::Result<Self> {
        let types = infer_types(graph)?;
        let order = graph.topo_order()?;
        let position: HashMap<NodeIndex, usize> = order.iter().enumerate().map(|(i, idx)| (*idx, i)).collect();

        let mut inputs = Vec::new();
        for &idx in &graph.inputs {
            if let NodeKind::Input { name, ty } = &graph.node(idx).kind {
                inputs.push(Port::new(name, ty));
            }
        }

        let mut outputs = Vec::new();
        for &idx in &graph.outputs {
            let node = graph.node(idx);
            let NodeKind::Output { name } = &node.kind else { continue };
            let value = graph.output_source(idx)
                .ok_or_else(|| anyhow::anyhow!("Output '{}' is not connected", name))?;
            let ty = types.get(&value)
                .ok_or_else(|| anyhow::anyhow!("No type for output '{}'", name))?;
            outputs.push(Port::new(name, ty));
        }

        let mut nodes = Vec::new();
        for &idx in &order {
            let node = graph.node(idx);
            let mut def = NodeDef {
                id: node.id.clone(),
                op: None,
                attrs: Attrs::new(),
                outputs: 1,
                target: node.tag.clone(),
                constant: None,
                call: None,
                results: None,
            };
            match &node.kind {
                NodeKind::Input { .. } | NodeKind::Output { .. } => continue,
                NodeKind::Constant { ty, values } => {
                    def.constant = Some(ConstantDef { shape: ty.shape.clone(), dtype: ty.dtype, values: values.clone() });
                }
                NodeKind::Op { name, attrs, num_outputs } => {
                    def.op = Some(name.clone());
                    def.attrs = attrs.clone();
                    def.outputs = *num_outputs;
                }
                NodeKind::Call { function, results } => {
                    def.call = Some(function.clone());
                    def.outputs = results.len();
                    def.results = Some(results.clone());
                }
            }
            nodes.push(def);
        }

        let mut edges: Vec<_> = graph.graph.edge_references().collect();
        edges.sort_by_key(|e| (position[&e.target()], e.weight().dst_slot));
        let links = edges.into_iter().map(|e| {
            let src = source_address(graph, ValueRef::new(e.source(), e.weight().src_slot));
            let dst = target_address(graph, e.target(), e.weight().dst_slot);
            if e.weight().boundary.is_empty() {
                LinkDef::Plain(src, dst)
            } else {
                LinkDef::Marked(src, dst, e.weight().boundary.clone())
            }
        }).collect();

        Ok(GraphDef { name: graph.name.clone(), inputs, outputs, nodes, links })
    }

    /// Rebuilds the graph. Every link endpoint must exist and the result must be acyclic.
    pub fn to_graph(&self) -> anyhow::Result<Graph> {
        let mut graph = Graph::new(&self.name);

        // 1. Primary inputs
        for port in &self.inputs {
            graph.add_input(&port.name, port.tensor_type())?;
        }

        // 2. Nodes, unconnected
        for def in &self.nodes {
            if def.id.starts_with("inputs.") || def.id.starts_with("outputs.") {
                return Err(anyhow::anyhow!("Node id '{}' uses a reserved prefix", def.id));
            }
            let idx = match (&def.op, &def.constant, &def.call) {
                (Some(op), None, None) => graph.add_op_multi(&def.id, op, def.attrs.clone(), &[], def.outputs)?,
                (None, Some(c), None) => {
                    graph.add_constant(&def.id, TensorType::new(&c.shape, c.dtype), c.values.clone())?.node
                }
                (None, None, Some(function)) => {
                    let results = def.results.clone()
                        .ok_or_else(|| anyhow::anyhow!("Call node '{}' needs 'results'", def.id))?;
                    graph.add_call(&def.id, function, &[], results)?
                }
                _ => return Err(anyhow::anyhow!("Node '{}' must have exactly one of op, constant, call", def.id)),
            };
            graph.set_tag(idx, def.target.as_deref());
        }

        // 3. Internal links; links into primary outputs are held back
        let mut output_sources: HashMap<&str, (ValueRef, Boundary)> = HashMap::new();
        for link in &self.links {
            let (src, dst) = link.endpoints();
            let value = resolve_source(&graph, src)?;
            if let Some(name) = dst.strip_prefix("outputs.") {
                if output_sources.insert(name, (value, link.boundary())).is_some() {
                    return Err(anyhow::anyhow!("Output '{}' is linked more than once", name));
                }
                continue;
            }
            let (node, slot) = resolve_target(&graph, dst)?;
            let edge = graph.connect(value, node, slot)?;
            graph.graph[edge].boundary = link.boundary();
        }

        // 4. Primary outputs
        for port in &self.outputs {
            let (value, boundary) = output_sources.remove(port.name.as_str())
                .ok_or_else(|| anyhow::anyhow!("Output '{}' has no incoming link", port.name))?;
            let idx = graph.add_output(&port.name, value)?;
            if let Some((edge, _)) = graph.operands(idx).first() {
                graph.graph[*edge].boundary = boundary;
            }
        }
        if let Some(name) = output_sources.keys().next() {
            return Err(anyhow::anyhow!("Link targets undeclared output '{}'", name));
        }

        graph.validate()?;
        Ok(graph)
    }
}

fn source_address(graph: &Graph, value: ValueRef) -> String {
    let node = graph.node(value.node);
    match node.kind {
        NodeKind::Input { .. } => node.id.clone(),
        _ => format!("{}.{}", node.id, value.slot),
    }
}

fn target_address(graph: &Graph, node: NodeIndex, slot: usize) -> String {
    let n = graph.node(node);
    match n.kind {
        NodeKind::Output { .. } => n.id.clone(),
        _ => format!("{}.{}", n.id, slot),
    }
}

/// `NODE.SLOT`, or a bare `NODE` meaning slot 0.
fn split_address(graph: &Graph, address: &str) -> anyhow::Result<(NodeIndex, usize)> {
    if let Some(idx) = graph.find(address) {
        return Ok((idx, 0));
    }
    let (id, slot) = address.rsplit_once('.')
        .ok_or_else(|| anyhow::anyhow!("Unknown link endpoint '{}'", address))?;
    let slot: usize = slot.parse()
        .map_err(|_| anyhow::anyhow!("Invalid slot in link endpoint '{}'", address))?;
    let idx = graph.find(id)
        .ok_or_else(|| anyhow::anyhow!("Link references unknown node '{}'", id))?;
    Ok((idx, slot))
}

fn resolve_source(graph: &Graph, address: &str) -> anyhow::Result<ValueRef> {
    let (idx, slot) = split_address(graph, address)?;
    if matches!(graph.node(idx).kind, NodeKind::Output { .. }) {
        return Err(anyhow::anyhow!("Output '{}' cannot be a link source", address));
    }
    Ok(ValueRef::new(idx, slot))
}

fn resolve_target(graph: &Graph, address: &str) -> anyhow::Result<(NodeIndex, usize)> {
    let (idx, slot) = split_address(graph, address)?;
    if matches!(graph.node(idx).kind, NodeKind::Input { .. } | NodeKind::Constant { .. }) {
        return Err(anyhow::anyhow!("'{}' cannot be a link target", address));
    }
    Ok((idx, slot))
}

pub fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read graph {:?}: {}", path, e))?;
    let mut graph = GraphDef::from_json(&content)?.to_graph()?;
    if graph.name.is_empty() {
        graph.name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("main").to_string();
    }
    Ok(graph)
}
