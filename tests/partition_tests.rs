mod common;

use common::{host_registry, inputs, mixed, mul_add, run};
use cvflow_partition::annotate::annotate;
use cvflow_partition::core::op::Attrs;
use cvflow_partition::core::types::TensorType;
use cvflow_partition::interp::{allclose, evaluate, Tensor};
use cvflow_partition::ir::{Graph, NodeKind, ValueRef};
use cvflow_partition::merge::{merge, CyclePolicy, MergeOptions};
use cvflow_partition::partition::inline;
use cvflow_partition::registry::Registry;
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, HashSet};

fn op_ids(graph: &Graph) -> Vec<String> {
    let mut ids: Vec<_> = graph.op_nodes().map(|i| graph.node(i).id.clone()).collect();
    ids.sort();
    ids
}

fn call_ids(graph: &Graph) -> Vec<String> {
    graph.call_nodes().map(|i| graph.node(i).id.clone()).collect()
}

#[test]
fn whole_graph_is_one_function() {
    let (merged, module) = run(&mul_add(), &Registry::cv22());

    assert_eq!(merged.regions.len(), 1);
    assert_eq!(merged.regions[0].nodes.len(), 2);

    let f = &module.functions["cv22_0"];
    assert_eq!(f.graph.inputs.len(), 3);
    assert_eq!(f.graph.outputs.len(), 1);
    assert_eq!(f.compiler, "cv22");
    assert_eq!(f.global_symbol, "cv22_0");
    assert_eq!(op_ids(&f.graph), ["add", "mul"]);

    assert!(op_ids(&module.main).is_empty());
    assert_eq!(call_ids(&module.main), ["cv22_0"]);
}

#[test]
fn host_add_stays_outside() {
    let registry = Registry::new("cv22").with_fixed("multiply", true);
    let (merged, module) = run(&mul_add(), &registry);

    assert_eq!(merged.regions.len(), 1);
    assert_eq!(merged.graph.node(merged.regions[0].nodes[0]).id, "mul");

    let f = &module.functions["cv22_0"];
    assert_eq!(f.graph.inputs.len(), 2);
    assert_eq!(f.graph.outputs.len(), 1);

    assert_eq!(op_ids(&module.main), ["add"]);
    assert_eq!(call_ids(&module.main), ["cv22_0"]);
    let add = module.main.find("add").unwrap();
    let operands: Vec<_> = module.main.operand_values(add).into_iter().map(|v| module.main.value_name(v)).collect();
    assert_eq!(operands, ["cv22_0", "c"]);
}

#[test]
fn numeric_result_is_preserved() {
    let g = mul_add();
    let (_, module) = run(&g, &Registry::cv22());
    let feed = inputs(&[
        ("a", vec![1, 2], vec![1.0, 2.0]),
        ("b", vec![1, 2], vec![3.0, 4.0]),
        ("c", vec![1, 2], vec![5.0, 6.0]),
    ]);

    let got = evaluate(&module.main, &module.functions, &feed).unwrap();
    let expected = Tensor::new(&[1, 2], vec![8.0, 14.0]).unwrap();
    assert!(allclose(&got["out"], &expected, 1e-5));

    let flat = evaluate(&inline(&module).unwrap(), &BTreeMap::new(), &feed).unwrap();
    assert!(allclose(&flat["out"], &expected, 1e-5));
}

#[test]
fn unknown_operator_leaves_graph_alone() {
    let mut g = Graph::new("main");
    let a = g.add_input("a", TensorType::f32(&[4])).unwrap();
    let b = g.add_input("b", TensorType::f32(&[4])).unwrap();
    let m = g.add_op("m", "mod", Attrs::new(), &[a, b]).unwrap();
    g.add_output("out", m).unwrap();

    let annotated = annotate(&g, &Registry::cv22()).unwrap();
    assert!(annotated.graph.node_weights().all(|n| n.tag.is_none()));
    assert!(annotated.structurally_eq(&g));

    let (merged, module) = run(&g, &Registry::cv22());
    assert!(merged.regions.is_empty());
    assert!(module.functions.is_empty());
    assert!(module.main.structurally_eq(&g));
}

#[test]
fn unknown_multi_output_operator_stays_on_host() {
    let mut g = Graph::new("main");
    let x = g.add_input("x", TensorType::f32(&[1, 4])).unwrap();
    let topk = g.add_op_multi("topk", "vendor.topk", Attrs::new(), &[x], 2).unwrap();
    let r = g.add_op("relu", "nn.relu", Attrs::new(), &[ValueRef::new(topk, 0)]).unwrap();
    let t = g.add_op("tanh", "tanh", Attrs::new(), &[ValueRef::new(topk, 1)]).unwrap();
    g.add_output("values", r).unwrap();
    g.add_output("indices", t).unwrap();

    let annotated = annotate(&g, &Registry::cv22()).unwrap();
    assert_eq!(annotated.tag(annotated.find("topk").unwrap()), None);
    assert_eq!(annotated.tag(annotated.find("relu").unwrap()), Some("cv22"));

    let (_, module) = run(&g, &Registry::cv22());
    assert_eq!(module.functions.len(), 2);
    assert_eq!(op_ids(&module.main), ["topk"]);
    assert!(inline(&module).unwrap().structurally_eq(&g));
}

#[test]
fn untyped_operator_and_its_consumers_stay_on_host() {
    let mut g = Graph::new("main");
    let x = g.add_input("x", TensorType::f32(&[4])).unwrap();
    let src = g.add_op_multi("src", "vendor.source", Attrs::new(), &[], 1).unwrap();
    let a = g.add_op("add", "add", Attrs::new(), &[x, ValueRef::new(src, 0)]).unwrap();
    let m = g.add_op("mul", "multiply", Attrs::new(), &[x, x]).unwrap();
    g.add_output("out", a).unwrap();
    g.add_output("sq", m).unwrap();

    let annotated = annotate(&g, &Registry::cv22()).unwrap();
    assert_eq!(annotated.tag(annotated.find("src").unwrap()), None);
    assert_eq!(annotated.tag(annotated.find("add").unwrap()), None);
    assert_eq!(annotated.tag(annotated.find("mul").unwrap()), Some("cv22"));

    let (_, module) = run(&g, &Registry::cv22());
    assert_eq!(op_ids(&module.functions["cv22_0"].graph), ["mul"]);
    assert_eq!(op_ids(&module.main), ["add", "src"]);
    assert!(inline(&module).unwrap().structurally_eq(&g));
}

#[test]
fn batch_norm_statistics_leave_the_function() {
    let mut g = Graph::new("main");
    let x = g.add_input("x", TensorType::f32(&[1, 2, 4, 4])).unwrap();
    let stat = |g: &mut Graph, id: &str| g.add_constant(id, TensorType::f32(&[2]), vec![0.5, 1.5]).unwrap();
    let (gamma, beta, mean, var) = (stat(&mut g, "gamma"), stat(&mut g, "beta"), stat(&mut g, "mean"), stat(&mut g, "var"));
    let bn = g.add_op_multi("bn", "nn.batch_norm", Attrs::new(), &[x, gamma, beta, mean, var], 3).unwrap();
    let r = g.add_op("relu", "nn.relu", Attrs::new(), &[ValueRef::new(bn, 0)]).unwrap();
    g.add_output("out", r).unwrap();
    g.add_output("running_mean", ValueRef::new(bn, 1)).unwrap();

    let (merged, module) = run(&g, &Registry::cv22());
    assert_eq!(merged.regions.len(), 1);
    let f = &module.functions["cv22_0"];
    assert_eq!(op_ids(&f.graph), ["bn", "relu"]);
    assert_eq!(f.graph.inputs.len(), 5);
    assert_eq!(f.graph.outputs.len(), 2);

    let call = module.main.find("cv22_0").unwrap();
    let NodeKind::Call { results, .. } = &module.main.node(call).kind else { panic!("cv22_0 is not a call") };
    let shapes: Vec<_> = results.iter().map(|t| t.shape.clone()).collect();
    assert!(shapes.contains(&vec![1, 2, 4, 4]));
    assert!(shapes.contains(&vec![2]));
    assert!(inline(&module).unwrap().structurally_eq(&g));
}

#[test]
fn mixed_graph_splits_around_host_nodes() {
    let (merged, module) = run(&mixed(), &host_registry());

    let names: Vec<_> = module.functions.keys().cloned().collect();
    assert_eq!(names, ["cv22_0", "cv22_1", "cv22_2"]);
    assert_eq!(op_ids(&module.functions["cv22_0"].graph), ["mul", "tanh"]);
    assert_eq!(op_ids(&module.functions["cv22_1"].graph), ["sum"]);
    assert_eq!(op_ids(&module.functions["cv22_2"].graph), ["diff", "relu"]);
    assert_eq!(module.functions["cv22_0"].graph.outputs.len(), 2);
    assert_eq!(op_ids(&module.main), ["abs", "neg"]);
    assert_eq!(merged.regions.len(), 3);
}

#[test]
fn mixed_graph_fails_under_strict_policy() {
    let annotated = annotate(&mixed(), &host_registry()).unwrap();
    let err = merge(&annotated, MergeOptions { on_cycle: CyclePolicy::Fail }).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn annotation_is_idempotent() {
    for (g, registry) in [(mul_add(), Registry::cv22()), (mixed(), host_registry())] {
        let once = annotate(&g, &registry).unwrap();
        let twice = annotate(&once, &registry).unwrap();
        assert!(once.structurally_eq(&twice));
    }
}

#[test]
fn regions_are_maximal() {
    let (merged, _) = run(&mixed(), &host_registry());
    let g = &merged.graph;
    for e in g.graph.edge_references() {
        let (src, dst) = (g.node(e.source()), g.node(e.target()));
        if !src.kind.is_op() || !dst.kind.is_op() || src.tag.is_none() || src.tag != dst.tag {
            continue;
        }
        if e.weight().boundary.is_empty() {
            let (a, b) = (merged.region_of(e.source()).unwrap(), merged.region_of(e.target()).unwrap());
            assert_eq!(a.id, b.id, "{} and {} were left apart", src.id, dst.id);
        }
    }
}

#[test]
fn frontier_matches_distinct_crossing_values() {
    let (merged, module) = run(&mixed(), &host_registry());
    let g = &merged.graph;
    let names: Vec<_> = module.functions.keys().cloned().collect();

    for (region, name) in merged.regions.iter().zip(&names) {
        let members: HashSet<_> = region.nodes.iter().copied().collect();
        let entering: HashSet<ValueRef> = region.nodes.iter()
            .flat_map(|&n| g.operand_values(n))
            .filter(|v| !members.contains(&v.node))
            .collect();
        let leaving: HashSet<ValueRef> = g.graph.edge_references()
            .filter(|e| members.contains(&e.source()) && !members.contains(&e.target()))
            .map(|e| ValueRef::new(e.source(), e.weight().src_slot))
            .collect();

        let f = &module.functions[name];
        assert_eq!(f.graph.inputs.len(), entering.len(), "{}", name);
        assert_eq!(f.graph.outputs.len(), leaving.len(), "{}", name);
    }
}

#[test]
fn names_are_unique_and_reproducible() {
    let (_, first) = run(&mixed(), &host_registry());
    let (_, second) = run(&mixed(), &host_registry());
    assert_eq!(first.functions.keys().collect::<Vec<_>>(), second.functions.keys().collect::<Vec<_>>());
    assert!(first.main.structurally_eq(&second.main));
    for (name, f) in &first.functions {
        assert!(f.graph.structurally_eq(&second.functions[name].graph));
    }

    let calls = call_ids(&first.main);
    let unique: HashSet<_> = calls.iter().collect();
    assert_eq!(unique.len(), calls.len());
}

#[test]
fn names_avoid_existing_calls() {
    let mut g = mul_add();
    let out = g.find("outputs.out").unwrap();
    let sum = g.output_source(out).unwrap();
    let ty = TensorType::f32(&[1, 2]);
    let call = g.add_call("cv22_0", "cv22_0", &[sum], vec![ty]).unwrap();
    g.add_output("extra", ValueRef::new(call, 0)).unwrap();

    let (_, module) = run(&g, &Registry::cv22());
    assert_eq!(module.functions.keys().collect::<Vec<_>>(), ["cv22_1"]);
    let kinds: Vec<_> = module.main.call_nodes()
        .filter_map(|i| match &module.main.node(i).kind {
            NodeKind::Call { function, .. } => Some(function.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(kinds.len(), 2);
}

#[test]
fn round_trip_restores_the_graph() {
    let g = mixed();
    let (_, module) = run(&g, &host_registry());
    assert!(inline(&module).unwrap().structurally_eq(&g));

    let feed = inputs(&[
        ("x", vec![2, 3], vec![-1.5, -0.5, 0.0, 0.5, 1.0, 2.0]),
        ("y", vec![2, 3], vec![0.25, -2.0, 3.0, 1.0, -1.0, 0.5]),
    ]);
    let expected = evaluate(&g, &BTreeMap::new(), &feed).unwrap();
    let got = evaluate(&module.main, &module.functions, &feed).unwrap();
    for name in ["out", "aux"] {
        assert!(allclose(&got[name], &expected[name], 1e-5), "{}", name);
    }
}


#[test]
fn bundled_conv_block_splits_around_erf() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/conv_block.json");
    let g = cvflow_partition::ir::json::load_graph(&path).unwrap();
    let (_, module) = run(&g, &Registry::cv22());

    assert_eq!(op_ids(&module.functions["cv22_0"].graph), ["bias", "conv", "relu"]);
    assert_eq!(op_ids(&module.functions["cv22_1"].graph), ["flat", "pool"]);
    assert_eq!(module.functions["cv22_0"].graph.inputs.len(), 3);
    assert_eq!(op_ids(&module.main), ["erf"]);
    assert!(inline(&module).unwrap().structurally_eq(&g));
}
