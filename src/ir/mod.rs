pub mod infer;
pub mod json;

use crate::core::op::Attrs;
use crate::core::types::TensorType;
use crate::error::PartitionError;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Primary input of the graph
    Input { name: String, ty: TensorType },
    Constant { ty: TensorType, values: Vec<f32> },
    Op { name: String, attrs: Attrs, num_outputs: usize },
    /// Opaque call into an extracted function
    Call { function: String, results: Vec<TensorType> },
    /// Primary output sink, consumes exactly one value
    Output { name: String },
}

impl NodeKind {
    pub fn num_outputs(&self) -> usize {
        match self {
            NodeKind::Input { .. } | NodeKind::Constant { .. } => 1,
            NodeKind::Op { num_outputs, .. } => *num_outputs,
            NodeKind::Call { results, .. } => results.len(),
            NodeKind::Output { .. } => 0,
        }
    }

    pub fn op_name(&self) -> Option<&str> {
        match self {
            NodeKind::Op { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_op(&self) -> bool {
        matches!(self, NodeKind::Op { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    /// Backend the node is offloaded to, if any
    pub tag: Option<String>,
}

/// Region markers sitting on an edge. An edge between two differently
/// tagged nodes carries both an end (of the producer's region) and a begin
/// (of the consumer's region).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Boundary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryRole {
    None,
    RegionBegin,
    RegionEnd,
    /// End of one region immediately followed by the begin of another
    EndBegin,
}

impl Boundary {
    pub fn is_empty(&self) -> bool {
        self.end.is_none() && self.begin.is_none()
    }

    pub fn role(&self) -> BoundaryRole {
        match (&self.end, &self.begin) {
            (None, None) => BoundaryRole::None,
            (None, Some(_)) => BoundaryRole::RegionBegin,
            (Some(_), None) => BoundaryRole::RegionEnd,
            (Some(_), Some(_)) => BoundaryRole::EndBegin,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub src_slot: usize,
    pub dst_slot: usize,
    pub boundary: Boundary,
}

/// One output slot of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueRef {
    pub node: NodeIndex,
    pub slot: usize,
}

impl ValueRef {
    pub fn new(node: NodeIndex, slot: usize) -> Self {
        Self { node, slot }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    pub graph: DiGraph<Node, Link>,
    /// Primary inputs in declaration order
    pub inputs: Vec<NodeIndex>,
    /// Primary outputs in declaration order
    pub outputs: Vec<NodeIndex>,
    pub node_map: HashMap<String, NodeIndex>,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    fn add_node(&mut self, id: &str, kind: NodeKind) -> anyhow::Result<NodeIndex> {
        if self.node_map.contains_key(id) {
            return Err(anyhow::anyhow!("Duplicate node id '{}' in graph '{}'", id, self.name));
        }
        let idx = self.graph.add_node(Node { id: id.to_string(), kind, tag: None });
        self.node_map.insert(id.to_string(), idx);
        Ok(idx)
    }

    pub fn add_input(&mut self, name: &str, ty: TensorType) -> anyhow::Result<ValueRef> {
        let idx = self.add_node(&format!("inputs.{}", name), NodeKind::Input { name: name.to_string(), ty })?;
        self.inputs.push(idx);
        Ok(ValueRef::new(idx, 0))
    }

    pub fn add_constant(&mut self, id: &str, ty: TensorType, values: Vec<f32>) -> anyhow::Result<ValueRef> {
        if values.len() != ty.numel() {
            return Err(anyhow::anyhow!("Constant '{}' has {} values for type {}", id, values.len(), ty));
        }
        let idx = self.add_node(id, NodeKind::Constant { ty, values })?;
        Ok(ValueRef::new(idx, 0))
    }

    pub fn add_op(&mut self, id: &str, name: &str, attrs: Attrs, operands: &[ValueRef]) -> anyhow::Result<ValueRef> {
        let idx = self.add_op_multi(id, name, attrs, operands, 1)?;
        Ok(ValueRef::new(idx, 0))
    }

    pub fn add_op_multi(
        &mut self,
        id: &str,
        name: &str,
        attrs: Attrs,
        operands: &[ValueRef],
        num_outputs: usize,
    ) -> anyhow::Result<NodeIndex> {
        let idx = self.add_node(id, NodeKind::Op { name: name.to_string(), attrs, num_outputs })?;
        for (slot, v) in operands.iter().enumerate() {
            self.connect(*v, idx, slot)?;
        }
        Ok(idx)
    }

    pub fn add_call(
        &mut self,
        id: &str,
        function: &str,
        operands: &[ValueRef],
        results: Vec<TensorType>,
    ) -> anyhow::Result<NodeIndex> {
        let idx = self.add_node(id, NodeKind::Call { function: function.to_string(), results })?;
        for (slot, v) in operands.iter().enumerate() {
            self.connect(*v, idx, slot)?;
        }
        Ok(idx)
    }

    pub fn add_output(&mut self, name: &str, value: ValueRef) -> anyhow::Result<NodeIndex> {
        let idx = self.add_node(&format!("outputs.{}", name), NodeKind::Output { name: name.to_string() })?;
        self.connect(value, idx, 0)?;
        self.outputs.push(idx);
        Ok(idx)
    }

    /// Adds an unwired node of any kind. The primary input and output lists
    /// are left to the caller.
    pub fn insert_node(&mut self, id: &str, kind: NodeKind, tag: Option<&str>) -> anyhow::Result<NodeIndex> {
        let idx = self.add_node(id, kind)?;
        self.set_tag(idx, tag);
        Ok(idx)
    }

    pub fn connect(&mut self, src: ValueRef, dst: NodeIndex, dst_slot: usize) -> anyhow::Result<EdgeIndex> {
        let producer = self.graph.node_weight(src.node)
            .ok_or_else(|| anyhow::anyhow!("Unknown producer {:?}", src.node))?;
        if src.slot >= producer.kind.num_outputs() {
            return Err(anyhow::anyhow!("Node '{}' has no output slot {}", producer.id, src.slot));
        }
        Ok(self.graph.add_edge(src.node, dst, Link { src_slot: src.slot, dst_slot, boundary: Boundary::default() }))
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.graph[idx]
    }

    pub fn find(&self, id: &str) -> Option<NodeIndex> {
        self.node_map.get(id).copied()
    }

    pub fn set_tag(&mut self, idx: NodeIndex, tag: Option<&str>) {
        self.graph[idx].tag = tag.map(|t| t.to_string());
    }

    pub fn tag(&self, idx: NodeIndex) -> Option<&str> {
        self.graph[idx].tag.as_deref()
    }

    /// Incoming edges ordered by input slot.
    pub fn operands(&self, idx: NodeIndex) -> Vec<(EdgeIndex, ValueRef)> {
        let mut incoming: Vec<_> = self.graph.edges_directed(idx, Direction::Incoming).collect();
        incoming.sort_by_key(|e| (e.weight().dst_slot, e.id()));
        incoming.into_iter()
            .map(|e| (e.id(), ValueRef::new(e.source(), e.weight().src_slot)))
            .collect()
    }

    pub fn operand_values(&self, idx: NodeIndex) -> Vec<ValueRef> {
        self.operands(idx).into_iter().map(|(_, v)| v).collect()
    }

    /// Outgoing edges as (edge, consumer, consumer input slot), in edge creation order.
    pub fn consumers(&self, value: ValueRef) -> Vec<(EdgeIndex, NodeIndex, usize)> {
        let mut outgoing: Vec<_> = self.graph.edges_directed(value.node, Direction::Outgoing)
            .filter(|e| e.weight().src_slot == value.slot)
            .map(|e| (e.id(), e.target(), e.weight().dst_slot))
            .collect();
        outgoing.sort_by_key(|(e, _, _)| *e);
        outgoing
    }

    /// Topological order that prefers lower node indices, so a graph built
    /// in definition order is visited in exactly that order.
    pub fn topo_order(&self) -> Result<Vec<NodeIndex>, PartitionError> {
        let mut indegree: HashMap<NodeIndex, usize> = self.graph.node_indices()
            .map(|idx| (idx, self.graph.edges_directed(idx, Direction::Incoming).count()))
            .collect();
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = indegree.iter()
            .filter(|(_, d)| **d == 0)
            .map(|(idx, _)| Reverse(*idx))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for e in self.graph.edges_directed(idx, Direction::Outgoing) {
                if let Some(d) = indegree.get_mut(&e.target()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(e.target()));
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let stuck = self.graph.node_indices()
                .find(|idx| indegree[idx] > 0)
                .map(|idx| self.graph[idx].id.clone())
                .unwrap_or_default();
            return Err(PartitionError::CyclicGraph(stuck));
        }
        Ok(order)
    }

    /// Human readable name of a value: `id` for single-output producers, `id.slot` otherwise.
    pub fn value_name(&self, value: ValueRef) -> String {
        let node = &self.graph[value.node];
        match &node.kind {
            NodeKind::Input { name, .. } => name.clone(),
            kind if kind.num_outputs() == 1 => node.id.clone(),
            _ => format!("{}.{}", node.id, value.slot),
        }
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().filter_map(|&idx| match &self.graph[idx].kind {
            NodeKind::Input { name, .. } => Some(name.clone()),
            _ => None,
        }).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().filter_map(|&idx| match &self.graph[idx].kind {
            NodeKind::Output { name } => Some(name.clone()),
            _ => None,
        }).collect()
    }

    /// The value feeding a primary output node.
    pub fn output_source(&self, output: NodeIndex) -> Option<ValueRef> {
        self.operand_values(output).first().copied()
    }

    pub fn op_nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices().filter(|&idx| self.graph[idx].kind.is_op())
    }

    pub fn call_nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices().filter(|&idx| matches!(self.graph[idx].kind, NodeKind::Call { .. }))
    }

    fn canonical_edges(&self) -> BTreeSet<(String, usize, String, usize, Boundary)> {
        self.graph.edge_references()
            .map(|e| (
                self.graph[e.source()].id.clone(),
                e.weight().src_slot,
                self.graph[e.target()].id.clone(),
                e.weight().dst_slot,
                e.weight().boundary.clone(),
            ))
            .collect()
    }

    /// Equality of nodes (by id), edges, tags, markers and interface order,
    /// independent of arena indices.
    pub fn structurally_eq(&self, other: &Graph) -> bool {
        if self.graph.node_count() != other.graph.node_count() {
            return false;
        }
        let same_nodes = self.graph.node_weights().all(|n| {
            other.find(&n.id).map(|idx| &other.graph[idx] == n).unwrap_or(false)
        });
        let ids = |g: &Graph, list: &[NodeIndex]| list.iter().map(|&i| g.graph[i].id.clone()).collect::<Vec<_>>();
        same_nodes
            && ids(self, &self.inputs) == ids(other, &other.inputs)
            && ids(self, &self.outputs) == ids(other, &other.outputs)
            && self.canonical_edges() == other.canonical_edges()
    }

    /// Rejects graphs whose edges do not line up with node arities.
    pub fn validate(&self) -> Result<(), PartitionError> {
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let operands = self.operands(idx);
            let mut slots: Vec<usize> = operands.iter()
                .map(|(e, _)| self.graph[*e].dst_slot)
                .collect();
            slots.dedup();
            if slots.len() != operands.len() || slots.iter().enumerate().any(|(i, s)| i != *s) {
                return Err(PartitionError::InvalidGraph(format!("node '{}' has gaps or duplicates in its input slots", node.id)));
            }
            match &node.kind {
                NodeKind::Input { .. } | NodeKind::Constant { .. } if !operands.is_empty() => {
                    return Err(PartitionError::InvalidGraph(format!("'{}' cannot have operands", node.id)));
                }
                NodeKind::Output { .. } if operands.len() != 1 => {
                    return Err(PartitionError::InvalidGraph(format!("output '{}' must consume exactly one value", node.id)));
                }
                _ => {}
            }
        }
        self.topo_order().map(|_| ())
    }
}
