//! Extracts merged regions into standalone functions and rewrites the
//! parent graph to call them.

use crate::error::PartitionError;
use crate::ir::infer::{infer_types_partial, TypeMap};
use crate::ir::{Graph, NodeKind, ValueRef};
use crate::merge::{MergedGraph, Region};
use petgraph::graph::NodeIndex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Backend that compiles this function
    pub compiler: String,
    pub global_symbol: String,
    pub graph: Graph,
}

#[derive(Debug, Clone)]
pub struct PartitionedModule {
    pub main: Graph,
    pub functions: BTreeMap<String, Function>,
}

/// Values crossing a region's border, in first-use order. A value used by
/// several members is one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Frontier {
    pub inputs: Vec<ValueRef>,
    pub outputs: Vec<ValueRef>,
}

pub fn frontier(graph: &Graph, region: &Region) -> Frontier {
    let members: HashSet<NodeIndex> = region.nodes.iter().copied().collect();
    let mut inputs = Vec::new();
    for &idx in &region.nodes {
        for v in graph.operand_values(idx) {
            if !members.contains(&v.node) && !inputs.contains(&v) {
                inputs.push(v);
            }
        }
    }
    let mut outputs = Vec::new();
    for &idx in &region.nodes {
        for slot in 0..graph.node(idx).kind.num_outputs() {
            let v = ValueRef::new(idx, slot);
            if graph.consumers(v).iter().any(|(_, c, _)| !members.contains(c)) {
                outputs.push(v);
            }
        }
    }
    Frontier { inputs, outputs }
}

fn invalid(e: anyhow::Error) -> PartitionError {
    PartitionError::InvalidGraph(e.to_string())
}

/// `<tag>_<n>` per tag, skipping names the graph already uses.
fn assign_names(graph: &Graph, regions: &[Region]) -> Result<Vec<String>, PartitionError> {
    let mut taken: HashSet<String> = graph.graph.node_weights().map(|n| n.id.clone()).collect();
    taken.extend(graph.call_nodes().filter_map(|idx| match &graph.node(idx).kind {
        NodeKind::Call { function, .. } => Some(function.clone()),
        _ => None,
    }));
    let mut counters: HashMap<&str, usize> = HashMap::new();
    let mut names = Vec::with_capacity(regions.len());
    for region in regions {
        let counter = counters.entry(region.tag.as_str()).or_insert(0);
        let mut name = format!("{}_{}", region.tag, counter);
        while taken.contains(&name) {
            *counter += 1;
            name = format!("{}_{}", region.tag, counter);
        }
        *counter += 1;
        if !taken.insert(name.clone()) {
            return Err(PartitionError::DuplicateFunction(name));
        }
        names.push(name);
    }
    Ok(names)
}

fn extract(graph: &Graph, types: &TypeMap, region: &Region, frontier: &Frontier, name: &str) -> Result<Function, PartitionError> {
    let mut body = Graph::new(name);
    let mut values: HashMap<ValueRef, ValueRef> = HashMap::new();

    // 1. One parameter per incoming value
    for (k, v) in frontier.inputs.iter().enumerate() {
        let ty = types.get(v).cloned().ok_or_else(|| PartitionError::InvalidGraph(
            format!("no type for '{}' entering {}", graph.value_name(*v), name),
        ))?;
        let param = body.add_input(&format!("{}_i{}", name, k), ty).map_err(invalid)?;
        values.insert(*v, param);
    }

    // 2. Members, keeping their ids
    for &idx in &region.nodes {
        let node = graph.node(idx);
        let NodeKind::Op { name: op, attrs, num_outputs } = &node.kind else {
            return Err(PartitionError::InvalidGraph(format!("'{}' in {} is not an operator", node.id, name)));
        };
        let operands = graph.operand_values(idx).into_iter()
            .map(|v| values.get(&v).copied().ok_or_else(|| PartitionError::NotClosed {
                region: name.to_string(),
                node: graph.node(v.node).id.clone(),
            }))
            .collect::<Result<Vec<_>, _>>()?;
        let copy = body.add_op_multi(&node.id, op, attrs.clone(), &operands, *num_outputs).map_err(invalid)?;
        for slot in 0..*num_outputs {
            values.insert(ValueRef::new(idx, slot), ValueRef::new(copy, slot));
        }
    }

    // 3. One result per outgoing value
    for (k, v) in frontier.outputs.iter().enumerate() {
        let inner = values.get(v).copied().ok_or_else(|| PartitionError::NotClosed {
            region: name.to_string(),
            node: graph.node(v.node).id.clone(),
        })?;
        body.add_output(&format!("{}_o{}", name, k), inner).map_err(invalid)?;
    }

    debug!(function = name, params = frontier.inputs.len(), results = frontier.outputs.len(), "extracted");
    Ok(Function {
        name: name.to_string(),
        compiler: region.tag.clone(),
        global_symbol: name.to_string(),
        graph: body,
    })
}

fn rebuild(
    merged: &MergedGraph,
    types: &TypeMap,
    frontiers: &[Frontier],
    names: &[String],
) -> Result<Graph, PartitionError> {
    let graph = &merged.graph;
    let order = graph.topo_order()?;
    let mut main = Graph::new(&graph.name);
    let mut image: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut calls: Vec<Option<NodeIndex>> = vec![None; names.len()];
    let region_of = |idx: NodeIndex| merged.region_of(idx).map(|r| r.id);

    // 1. Host nodes keep their ids; each region becomes one call, placed at its first member
    for &idx in &order {
        match region_of(idx) {
            Some(r) if calls[r].is_none() => {
                let results = frontiers[r].outputs.iter()
                    .map(|v| types.get(v).cloned().ok_or_else(|| PartitionError::InvalidGraph(
                        format!("no type for '{}' leaving {}", graph.value_name(*v), names[r]),
                    )))
                    .collect::<Result<Vec<_>, _>>()?;
                let kind = NodeKind::Call { function: names[r].clone(), results };
                calls[r] = Some(main.insert_node(&names[r], kind, None).map_err(invalid)?);
            }
            Some(_) => {}
            None => {
                let node = graph.node(idx);
                let copy = main.insert_node(&node.id, node.kind.clone(), node.tag.as_deref()).map_err(invalid)?;
                image.insert(idx, copy);
            }
        }
    }

    let call_of = |r: usize| calls[r].ok_or_else(|| PartitionError::InvalidGraph(format!("{} has no call site", names[r])));
    let slot_of = |list: &[ValueRef], v: ValueRef, r: usize| list.iter().position(|x| *x == v)
        .ok_or_else(|| PartitionError::NotClosed { region: names[r].clone(), node: graph.node(v.node).id.clone() });

    // 2. Rewire every edge that is not internal to a region
    let mut bound: HashSet<(usize, usize)> = HashSet::new();
    for &idx in &order {
        let dst_region = region_of(idx);
        for (edge, v) in graph.operands(idx) {
            let src_region = region_of(v.node);
            if src_region.is_some() && src_region == dst_region {
                continue;
            }
            let src = match src_region {
                Some(r) => ValueRef::new(call_of(r)?, slot_of(&frontiers[r].outputs, v, r)?),
                None => ValueRef::new(image[&v.node], v.slot),
            };
            match dst_region {
                Some(r) => {
                    let k = slot_of(&frontiers[r].inputs, v, r)?;
                    if bound.insert((r, k)) {
                        main.connect(src, call_of(r)?, k).map_err(invalid)?;
                    }
                }
                None => {
                    main.connect(src, image[&idx], graph.graph[edge].dst_slot).map_err(invalid)?;
                }
            }
        }
    }

    main.inputs = graph.inputs.iter().filter_map(|i| image.get(i).copied()).collect();
    main.outputs = graph.outputs.iter().filter_map(|o| image.get(o).copied()).collect();

    main.validate().map_err(|e| match e {
        PartitionError::CyclicGraph(node) => PartitionError::CyclicResidual(node),
        other => other,
    })?;
    Ok(main)
}

/// Splits every region out of `merged`. Fails as a whole if any region
/// cannot be extracted.
pub fn partition(merged: &MergedGraph) -> Result<PartitionedModule, PartitionError> {
    let graph = &merged.graph;
    let types = infer_types_partial(graph).map_err(invalid)?;
    let names = assign_names(graph, &merged.regions)?;

    let extracted: Vec<(Frontier, Function)> = merged.regions
        .par_iter()
        .zip(names.par_iter())
        .map(|(region, name)| {
            let f = frontier(graph, region);
            let func = extract(graph, &types, region, &f, name)?;
            Ok::<_, PartitionError>((f, func))
        })
        .collect::<Result<_, PartitionError>>()?;

    let frontiers: Vec<Frontier> = extracted.iter().map(|(f, _)| f.clone()).collect();
    let main = rebuild(merged, &types, &frontiers, &names)?;

    let mut functions = BTreeMap::new();
    for (_, func) in extracted {
        if functions.insert(func.name.clone(), func).is_some() {
            return Err(PartitionError::DuplicateFunction(names.join(", ")));
        }
    }

    info!(graph = %graph.name, functions = functions.len(), "partition done");
    Ok(PartitionedModule { main, functions })
}

fn inline_body(out: &mut Graph, body: &Graph, args: &[ValueRef], call_id: &str) -> anyhow::Result<Vec<ValueRef>> {
    let mut values: HashMap<ValueRef, ValueRef> = HashMap::new();
    for (k, &param) in body.inputs.iter().enumerate() {
        let arg = args.get(k)
            .ok_or_else(|| anyhow::anyhow!("Call '{}' passes {} arguments to '{}'", call_id, args.len(), body.name))?;
        values.insert(ValueRef::new(param, 0), *arg);
    }
    for idx in body.topo_order()? {
        let node = body.node(idx);
        if matches!(node.kind, NodeKind::Input { .. } | NodeKind::Output { .. }) {
            continue;
        }
        let id = match out.find(&node.id) {
            None => node.id.clone(),
            Some(_) => format!("{}/{}", call_id, node.id),
        };
        let copy = out.insert_node(&id, node.kind.clone(), node.tag.as_deref())?;
        for (slot, v) in body.operand_values(idx).into_iter().enumerate() {
            let src = values.get(&v).copied()
                .ok_or_else(|| anyhow::anyhow!("'{}' in '{}' uses an unbound value", node.id, body.name))?;
            out.connect(src, copy, slot)?;
        }
        for slot in 0..node.kind.num_outputs() {
            values.insert(ValueRef::new(idx, slot), ValueRef::new(copy, slot));
        }
    }
    body.outputs.iter()
        .map(|&o| body.output_source(o).and_then(|v| values.get(&v).copied())
            .ok_or_else(|| anyhow::anyhow!("Result of '{}' is unbound", body.name)))
        .collect()
}

/// Replaces every call to a function of `module` with that function's body.
pub fn inline(module: &PartitionedModule) -> anyhow::Result<Graph> {
    let main = &module.main;
    let mut out = Graph::new(&main.name);
    let mut values: HashMap<ValueRef, ValueRef> = HashMap::new();
    let mut image: HashMap<NodeIndex, NodeIndex> = HashMap::new();

    for idx in main.topo_order()? {
        let node = main.node(idx);
        let operands = main.operand_values(idx).into_iter()
            .map(|v| values.get(&v).copied().ok_or_else(|| anyhow::anyhow!("'{}' uses an unbound value", node.id)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        if let NodeKind::Call { function, .. } = &node.kind {
            if let Some(func) = module.functions.get(function) {
                let results = inline_body(&mut out, &func.graph, &operands, &node.id)?;
                for (slot, v) in results.into_iter().enumerate() {
                    values.insert(ValueRef::new(idx, slot), v);
                }
                continue;
            }
        }

        let copy = out.insert_node(&node.id, node.kind.clone(), node.tag.as_deref())?;
        for (slot, v) in operands.into_iter().enumerate() {
            out.connect(v, copy, slot)?;
        }
        for slot in 0..node.kind.num_outputs() {
            values.insert(ValueRef::new(idx, slot), ValueRef::new(copy, slot));
        }
        image.insert(idx, copy);
    }

    out.inputs = main.inputs.iter().filter_map(|i| image.get(i).copied()).collect();
    out.outputs = main.outputs.iter().filter_map(|o| image.get(o).copied()).collect();
    out.validate()?;
    Ok(out)
}
