use crate::ir::infer::{infer_types_partial, operand_types};
use crate::ir::{Boundary, Graph, NodeKind, ValueRef};
use crate::registry::Registry;
use petgraph::visit::EdgeRef;
use tracing::{debug, info};

/// Tags every operator the registry supports with the registry's backend,
/// then places region markers. Nodes already claimed by another backend
/// keep their tag. An operator whose types cannot be inferred stays on the host.
pub fn annotate(graph: &Graph, registry: &Registry) -> anyhow::Result<Graph> {
    let backend = registry.backend();
    let types = infer_types_partial(graph)?;
    let mut out = graph.clone();

    let mut claimed = 0;
    for idx in graph.topo_order()? {
        let node = graph.node(idx);
        let NodeKind::Op { name, attrs, num_outputs } = &node.kind else { continue };
        match node.tag.as_deref() {
            Some(tag) if tag == backend => {
                claimed += 1;
                continue;
            }
            Some(tag) => {
                debug!(node = %node.id, owner = tag, "already claimed");
                continue;
            }
            None => {}
        }
        let typed = (0..*num_outputs).all(|slot| types.contains_key(&ValueRef::new(idx, slot)));
        if !typed {
            debug!(node = %node.id, op = %name, "untyped, stays on host");
            continue;
        }
        let args = operand_types(graph, &types, idx);
        if registry.is_supported(name, attrs, &args) {
            out.set_tag(idx, Some(backend));
            claimed += 1;
            debug!(node = %node.id, op = %name, backend, "offloaded");
        } else {
            debug!(node = %node.id, op = %name, "stays on host");
        }
    }

    mark_boundaries(&mut out);
    info!(graph = %graph.name, backend, claimed, "annotation done");
    Ok(out)
}

/// Recomputes every edge's markers from the current tags. An edge leaving a
/// tagged node towards anything with a different tag (including a primary
/// output) ends that region; an edge entering a tagged node from anything
/// with a different tag begins one.
pub fn mark_boundaries(graph: &mut Graph) {
    let edges: Vec<_> = graph.graph.edge_references()
        .map(|e| (e.id(), e.source(), e.target()))
        .collect();
    for (edge, src, dst) in edges {
        let producer = region_tag(graph, src);
        let consumer = region_tag(graph, dst);
        let boundary = if producer == consumer {
            Boundary::default()
        } else {
            Boundary {
                end: producer.map(str::to_string),
                begin: consumer.map(str::to_string),
            }
        };
        graph.graph[edge].boundary = boundary;
    }
}

/// Only operators take part in regions; inputs, constants, calls and outputs never do.
fn region_tag(graph: &Graph, idx: petgraph::graph::NodeIndex) -> Option<&str> {
    let node = graph.node(idx);
    if node.kind.is_op() { node.tag.as_deref() } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::Attrs;
    use crate::core::types::TensorType;
    use crate::ir::BoundaryRole;

    fn mul_add(tag_add: bool) -> Graph {
        let mut g = Graph::new("main");
        let a = g.add_input("a", TensorType::f32(&[1, 2])).unwrap();
        let b = g.add_input("b", TensorType::f32(&[1, 2])).unwrap();
        let c = g.add_input("c", TensorType::f32(&[1, 2])).unwrap();
        let m = g.add_op("mul", "multiply", Attrs::new(), &[a, b]).unwrap();
        let op = if tag_add { "add" } else { "vendor.add" };
        let s = g.add_op("add", op, Attrs::new(), &[m, c]).unwrap();
        g.add_output("out", s).unwrap();
        g
    }

    fn role(g: &Graph, from: &str, to: &str) -> BoundaryRole {
        let (src, dst) = (g.find(from).unwrap(), g.find(to).unwrap());
        let edge = g.graph.find_edge(src, dst).unwrap();
        g.graph[edge].boundary.role()
    }

    #[test]
    fn whole_graph_is_wrapped() {
        let g = annotate(&mul_add(true), &Registry::cv22()).unwrap();
        assert_eq!(g.tag(g.find("mul").unwrap()), Some("cv22"));
        assert_eq!(role(&g, "inputs.a", "mul"), BoundaryRole::RegionBegin);
        assert_eq!(role(&g, "mul", "add"), BoundaryRole::None);
        assert_eq!(role(&g, "add", "outputs.out"), BoundaryRole::RegionEnd);
    }

    #[test]
    fn unsupported_consumer_ends_region() {
        let g = annotate(&mul_add(false), &Registry::cv22()).unwrap();
        assert_eq!(g.tag(g.find("add").unwrap()), None);
        assert_eq!(role(&g, "mul", "add"), BoundaryRole::RegionEnd);
        assert_eq!(role(&g, "inputs.c", "add"), BoundaryRole::None);
    }

    #[test]
    fn foreign_tags_are_kept_and_bordered() {
        let mut g = mul_add(true);
        let add = g.find("add").unwrap();
        g.set_tag(add, Some("dnnl"));
        let g = annotate(&g, &Registry::cv22()).unwrap();
        assert_eq!(g.tag(add), Some("dnnl"));
        assert_eq!(role(&g, "mul", "add"), BoundaryRole::EndBegin);
    }

    #[test]
    fn untypable_scalar_concat_stays_on_host() {
        let mut g = Graph::new("main");
        let x = g.add_input("x", TensorType::f32(&[])).unwrap();
        let c = g.add_op("cat", "concatenate", Attrs::new(), &[x, x]).unwrap();
        let r = g.add_op("relu", "nn.relu", Attrs::new(), &[x]).unwrap();
        g.add_output("out", c).unwrap();
        g.add_output("act", r).unwrap();

        let g = annotate(&g, &Registry::cv22()).unwrap();
        assert_eq!(g.tag(g.find("cat").unwrap()), None);
        assert_eq!(g.tag(g.find("relu").unwrap()), Some("cv22"));
    }

    #[test]
    fn reannotation_is_stable() {
        let once = annotate(&mul_add(true), &Registry::cv22()).unwrap();
        let twice = annotate(&once, &Registry::cv22()).unwrap();
        assert!(once.structurally_eq(&twice));
    }
}
