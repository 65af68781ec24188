//! Coalesces same-tag operators into regions.
//!
//! Two tagged operators joined by an unmarked edge share a region. A union
//! that would make the contracted graph cyclic is either split (the edge
//! gets an end/begin marker pair) or reported, depending on [`CyclePolicy`].

use crate::error::PartitionError;
use crate::ir::{Boundary, Graph};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    #[default]
    Split,
    Fail,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    pub on_cycle: CyclePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Discovery index, in topological order of each region's first node
    pub id: usize,
    pub tag: String,
    /// Members in topological order
    pub nodes: Vec<NodeIndex>,
}

#[derive(Debug, Clone)]
pub struct MergedGraph {
    pub graph: Graph,
    pub regions: Vec<Region>,
    assignment: HashMap<NodeIndex, usize>,
}

impl MergedGraph {
    pub fn region_of(&self, idx: NodeIndex) -> Option<&Region> {
        self.assignment.get(&idx).map(|&r| &self.regions[r])
    }
}

fn region_tag(graph: &Graph, idx: NodeIndex) -> Option<&str> {
    let node = graph.node(idx);
    if node.kind.is_op() { node.tag.as_deref() } else { None }
}

struct Groups {
    uf: UnionFind<usize>,
    members: HashMap<usize, Vec<NodeIndex>>,
}

impl Groups {
    fn new(n: usize) -> Self {
        Self { uf: UnionFind::new(n), members: HashMap::new() }
    }

    fn root(&self, idx: NodeIndex) -> usize {
        self.uf.find(idx.index())
    }

    fn members(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.members.get(&self.root(idx)).cloned().unwrap_or_else(|| vec![idx])
    }

    fn union(&mut self, a: NodeIndex, b: NodeIndex) {
        let mut joined = self.members(a);
        joined.extend(self.members(b));
        let (ra, rb) = (self.root(a), self.root(b));
        self.members.remove(&ra);
        self.members.remove(&rb);
        self.uf.union(a.index(), b.index());
        let root = self.root(a);
        self.members.insert(root, joined);
    }

    /// True if some path leaves the group of `from`, passes through another
    /// group, and arrives in the group of `to`.
    fn detour_exists(&self, graph: &Graph, from: NodeIndex, to: NodeIndex) -> bool {
        let (src_root, dst_root) = (self.root(from), self.root(to));
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();

        for m in self.members(from) {
            for next in graph.graph.neighbors_directed(m, Direction::Outgoing) {
                let r = self.root(next);
                if r != src_root && r != dst_root && seen.insert(r) {
                    queue.push_back(next);
                }
            }
        }

        while let Some(idx) = queue.pop_front() {
            for m in self.members(idx) {
                for next in graph.graph.neighbors_directed(m, Direction::Outgoing) {
                    let r = self.root(next);
                    if r == dst_root {
                        return true;
                    }
                    if r != src_root && seen.insert(r) {
                        queue.push_back(next);
                    }
                }
            }
        }
        false
    }
}

pub fn merge(graph: &Graph, options: MergeOptions) -> Result<MergedGraph, PartitionError> {
    let order = graph.topo_order()?;
    let mut out = graph.clone();
    let mut groups = Groups::new(graph.graph.node_count());

    // 1. Union along unmarked same-tag edges, visiting consumers in topological order
    for &dst in &order {
        let Some(tag) = region_tag(graph, dst) else { continue };
        for (edge, value) in graph.operands(dst) {
            let src = value.node;
            if region_tag(graph, src) != Some(tag) || !graph.graph[edge].boundary.is_empty() {
                continue;
            }
            if groups.root(src) == groups.root(dst) {
                continue;
            }
            if groups.detour_exists(graph, src, dst) {
                let (left, right) = (graph.node(src).id.clone(), graph.node(dst).id.clone());
                match options.on_cycle {
                    CyclePolicy::Fail => return Err(PartitionError::CyclicMerge { left, right }),
                    CyclePolicy::Split => {
                        debug!(%left, %right, "union would close a cycle, splitting");
                        out.graph[edge].boundary = Boundary { end: Some(tag.to_string()), begin: Some(tag.to_string()) };
                        continue;
                    }
                }
            }
            groups.union(src, dst);
        }
    }

    // 2. Number regions in discovery order
    let mut regions: Vec<Region> = Vec::new();
    let mut by_root: HashMap<usize, usize> = HashMap::new();
    let mut assignment = HashMap::new();
    for &idx in &order {
        let Some(tag) = region_tag(graph, idx) else { continue };
        let root = groups.root(idx);
        let id = *by_root.entry(root).or_insert_with(|| {
            regions.push(Region { id: regions.len(), tag: tag.to_string(), nodes: Vec::new() });
            regions.len() - 1
        });
        regions[id].nodes.push(idx);
        assignment.insert(idx, id);
    }

    // 3. The contracted graph must stay a DAG
    check_contracted(&out, &regions, &assignment)?;

    let split = out.graph.edge_weights().filter(|l| l.boundary.end.is_some() && l.boundary.end == l.boundary.begin).count();
    if split > 0 {
        warn!(graph = %graph.name, split, "regions split to keep the residual graph acyclic");
    }
    info!(graph = %graph.name, regions = regions.len(), "merge done");
    Ok(MergedGraph { graph: out, regions, assignment })
}

fn check_contracted(graph: &Graph, regions: &[Region], assignment: &HashMap<NodeIndex, usize>) -> Result<(), PartitionError> {
    let mut contracted: DiGraph<Option<usize>, ()> = DiGraph::new();
    let region_nodes: Vec<_> = regions.iter().map(|r| contracted.add_node(Some(r.id))).collect();
    let mut host_nodes = HashMap::new();
    let mut image = |idx: NodeIndex, g: &mut DiGraph<Option<usize>, ()>| match assignment.get(&idx) {
        Some(&r) => region_nodes[r],
        None => *host_nodes.entry(idx).or_insert_with(|| g.add_node(None)),
    };
    for edge in graph.graph.edge_indices() {
        let Some((src, dst)) = graph.graph.edge_endpoints(edge) else { continue };
        let (a, b) = (image(src, &mut contracted), image(dst, &mut contracted));
        if a != b {
            contracted.update_edge(a, b, ());
        }
    }
    toposort(&contracted, None).map(|_| ()).map_err(|cycle| {
        let name = match contracted[cycle.node_id()] {
            Some(r) => format!("{}#{}", regions[r].tag, r),
            None => "host".to_string(),
        };
        PartitionError::CyclicResidual(name)
    })
}
