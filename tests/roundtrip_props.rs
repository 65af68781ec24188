mod common;

use common::{host_registry, run};
use cvflow_partition::core::op::Attrs;
use cvflow_partition::core::types::TensorType;
use cvflow_partition::interp::{allclose, evaluate, Tensor};
use cvflow_partition::ir::{Graph, ValueRef};
use cvflow_partition::partition::inline;
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};

const UNARY: &[&str] = &["tanh", "sigmoid", "nn.relu", "abs", "negative"];
const BINARY: &[&str] = &["add", "subtract", "maximum", "minimum"];

/// One operator: kind index plus two picks among earlier values.
type Step = (usize, usize, usize);

fn build(steps: &[Step]) -> Graph {
    let mut g = Graph::new("random");
    let mut values = vec![
        g.add_input("x", TensorType::f32(&[3])).unwrap(),
        g.add_input("y", TensorType::f32(&[3])).unwrap(),
    ];
    for (i, &(kind, a, b)) in steps.iter().enumerate() {
        let (a, b) = (values[a % values.len()], values[b % values.len()]);
        let v = if kind < UNARY.len() {
            g.add_op(&format!("n{}", i), UNARY[kind], Attrs::new(), &[a]).unwrap()
        } else {
            let op = BINARY[(kind - UNARY.len()) % BINARY.len()];
            g.add_op(&format!("n{}", i), op, Attrs::new(), &[a, b]).unwrap()
        };
        values.push(v);
    }
    // Every value nobody consumes becomes an output, so nothing is dead.
    let used: HashSet<ValueRef> = g.graph.node_indices().flat_map(|n| g.operand_values(n)).collect();
    let sinks: Vec<ValueRef> = values.iter().skip(2).filter(|v| !used.contains(*v)).copied().collect();
    for (k, v) in sinks.into_iter().enumerate() {
        g.add_output(&format!("out{}", k), v).unwrap();
    }
    g
}

fn step() -> impl Strategy<Value = Step> {
    (0..UNARY.len() + BINARY.len(), 0..64usize, 0..64usize)
}

proptest! {
    #[test]
    fn partitioned_graph_computes_the_same_values(
        steps in prop::collection::vec(step(), 1..14),
        x in prop::collection::vec(-2.0f32..2.0, 3),
        y in prop::collection::vec(-2.0f32..2.0, 3),
    ) {
        let g = build(&steps);
        let (_, module) = run(&g, &host_registry());

        prop_assert!(inline(&module).unwrap().structurally_eq(&g));

        let feed: HashMap<String, Tensor> = [
            ("x".to_string(), Tensor::new(&[3], x).unwrap()),
            ("y".to_string(), Tensor::new(&[3], y).unwrap()),
        ].into_iter().collect();
        let expected = evaluate(&g, &BTreeMap::new(), &feed).unwrap();
        let got = evaluate(&module.main, &module.functions, &feed).unwrap();
        prop_assert_eq!(got.len(), expected.len());
        for (name, value) in &expected {
            prop_assert!(allclose(&got[name], value, 1e-5), "{} differs", name);
        }
    }
}
