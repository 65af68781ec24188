#![allow(dead_code)]

use cvflow_partition::annotate::annotate;
use cvflow_partition::core::op::Attrs;
use cvflow_partition::core::types::TensorType;
use cvflow_partition::interp::Tensor;
use cvflow_partition::ir::Graph;
use cvflow_partition::merge::{merge, MergeOptions, MergedGraph};
use cvflow_partition::partition::{partition, PartitionedModule};
use cvflow_partition::registry::Registry;
use std::collections::HashMap;

/// `(a * b) + c` on `[1, 2]` tensors.
pub fn mul_add() -> Graph {
    let mut g = Graph::new("main");
    let a = g.add_input("a", TensorType::f32(&[1, 2])).unwrap();
    let b = g.add_input("b", TensorType::f32(&[1, 2])).unwrap();
    let c = g.add_input("c", TensorType::f32(&[1, 2])).unwrap();
    let m = g.add_op("mul", "multiply", Attrs::new(), &[a, b]).unwrap();
    let s = g.add_op("add", "add", Attrs::new(), &[m, c]).unwrap();
    g.add_output("out", s).unwrap();
    g
}

/// CV22 with `abs` and `negative` kept on the host.
pub fn host_registry() -> Registry {
    Registry::cv22().with_fixed("abs", false).with_fixed("negative", false)
}

/// Offloaded and host operators interleaved so that merging has to split
/// around the host nodes.
pub fn mixed() -> Graph {
    let mut g = Graph::new("mixed");
    let x = g.add_input("x", TensorType::f32(&[2, 3])).unwrap();
    let y = g.add_input("y", TensorType::f32(&[2, 3])).unwrap();
    let m = g.add_op("mul", "multiply", Attrs::new(), &[x, y]).unwrap();
    let t = g.add_op("tanh", "tanh", Attrs::new(), &[m]).unwrap();
    let h = g.add_op("abs", "abs", Attrs::new(), &[m]).unwrap();
    let s = g.add_op("sum", "add", Attrs::new(), &[t, h]).unwrap();
    let n = g.add_op("neg", "negative", Attrs::new(), &[s]).unwrap();
    let r = g.add_op("relu", "nn.relu", Attrs::new(), &[x]).unwrap();
    let d = g.add_op("diff", "subtract", Attrs::new(), &[n, r]).unwrap();
    g.add_output("out", d).unwrap();
    g.add_output("aux", t).unwrap();
    g
}

pub fn run(graph: &Graph, registry: &Registry) -> (MergedGraph, PartitionedModule) {
    let annotated = annotate(graph, registry).unwrap();
    let merged = merge(&annotated, MergeOptions::default()).unwrap();
    let module = partition(&merged).unwrap();
    (merged, module)
}

pub fn inputs(items: &[(&str, Vec<usize>, Vec<f32>)]) -> HashMap<String, Tensor> {
    items.iter()
        .map(|(name, shape, data)| (name.to_string(), Tensor::new(shape, data.clone()).unwrap()))
        .collect()
}
