//! Text dump of graphs and partitioned modules.

use crate::ir::{Boundary, Graph, NodeKind, ValueRef};
use crate::partition::PartitionedModule;
use petgraph::graph::EdgeIndex;
use serde::Serialize;
use tera::{Context, Tera};

#[derive(Serialize)]
struct ParamView {
    name: String,
    ty: String,
}

#[derive(Serialize)]
struct LineView {
    id: String,
    expr: String,
    tag: Option<String>,
}

#[derive(Serialize)]
struct FunctionView {
    name: String,
    compiler: Option<String>,
    global_symbol: Option<String>,
    params: Vec<ParamView>,
    lines: Vec<LineView>,
    results: Vec<String>,
}

pub struct ModulePrinter {
    tera: Tera,
}

impl ModulePrinter {
    pub fn new() -> anyhow::Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template("module.txt", include_str!("../templates/module.txt.tera"))?;
        Ok(Self { tera })
    }

    pub fn print_graph(&self, graph: &Graph) -> anyhow::Result<String> {
        self.render(vec![view(graph, None)?])
    }

    /// Functions in name order, then the residual graph.
    pub fn print_module(&self, module: &PartitionedModule) -> anyhow::Result<String> {
        let mut views = Vec::with_capacity(module.functions.len() + 1);
        for f in module.functions.values() {
            views.push(view(&f.graph, Some((f.compiler.as_str(), f.global_symbol.as_str())))?);
        }
        views.push(view(&module.main, None)?);
        self.render(views)
    }

    fn render(&self, functions: Vec<FunctionView>) -> anyhow::Result<String> {
        let mut context = Context::new();
        context.insert("functions", &functions);
        Ok(self.tera.render("module.txt", &context)?)
    }
}

fn operand_expr(graph: &Graph, edge: EdgeIndex, value: ValueRef) -> String {
    let mut expr = format!("%{}", graph.value_name(value));
    let Boundary { end, begin } = &graph.graph[edge].boundary;
    if let Some(tag) = end {
        expr = format!("end({}, \"{}\")", expr, tag);
    }
    if let Some(tag) = begin {
        expr = format!("begin({}, \"{}\")", expr, tag);
    }
    expr
}

fn view(graph: &Graph, external: Option<(&str, &str)>) -> anyhow::Result<FunctionView> {
    let params = graph.inputs.iter()
        .filter_map(|&idx| match &graph.node(idx).kind {
            NodeKind::Input { name, ty } => Some(ParamView { name: name.clone(), ty: ty.to_string() }),
            _ => None,
        })
        .collect();

    let mut lines = Vec::new();
    for idx in graph.topo_order()? {
        let node = graph.node(idx);
        let args: Vec<String> = graph.operands(idx).into_iter()
            .map(|(edge, v)| operand_expr(graph, edge, v))
            .collect();
        let expr = match &node.kind {
            NodeKind::Input { .. } | NodeKind::Output { .. } => continue,
            NodeKind::Constant { ty, .. } => format!("constant({})", ty),
            NodeKind::Call { function, .. } => format!("@{}({})", function, args.join(", ")),
            NodeKind::Op { name, attrs, .. } => {
                let mut parts = args;
                for (key, value) in attrs {
                    parts.push(format!("{}={}", key, serde_json::to_string(value)?));
                }
                format!("{}({})", name, parts.join(", "))
            }
        };
        lines.push(LineView { id: node.id.clone(), expr, tag: node.tag.clone() });
    }

    let mut results = Vec::new();
    for &idx in &graph.outputs {
        let NodeKind::Output { name } = &graph.node(idx).kind else { continue };
        if let Some((edge, v)) = graph.operands(idx).into_iter().next() {
            results.push(format!("{}={}", name, operand_expr(graph, edge, v)));
        }
    }

    Ok(FunctionView {
        name: graph.name.clone(),
        compiler: external.map(|(c, _)| c.to_string()),
        global_symbol: external.map(|(_, s)| s.to_string()),
        params,
        lines,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::annotate;
    use crate::core::op::Attrs;
    use crate::core::types::TensorType;
    use crate::merge::{merge, MergeOptions};
    use crate::partition::partition;
    use crate::registry::Registry;

    fn mul_add() -> Graph {
        let mut g = Graph::new("main");
        let a = g.add_input("a", TensorType::f32(&[1, 2])).unwrap();
        let b = g.add_input("b", TensorType::f32(&[1, 2])).unwrap();
        let m = g.add_op("mul", "multiply", Attrs::new(), &[a, b]).unwrap();
        g.add_output("out", m).unwrap();
        g
    }

    #[test]
    fn annotated_graph_shows_markers() {
        let g = annotate(&mul_add(), &Registry::cv22()).unwrap();
        let text = ModulePrinter::new().unwrap().print_graph(&g).unwrap();
        assert!(text.contains("def @main(%a: Tensor[(1, 2), float32], %b: Tensor[(1, 2), float32])"));
        assert!(text.contains("%mul = multiply(begin(%a, \"cv22\"), begin(%b, \"cv22\")); /* cv22 */"));
        assert!(text.contains("(out=end(%mul, \"cv22\"))"));
    }

    #[test]
    fn module_lists_functions_then_main() {
        let annotated = annotate(&mul_add(), &Registry::cv22()).unwrap();
        let module = partition(&merge(&annotated, MergeOptions::default()).unwrap()).unwrap();
        let text = ModulePrinter::new().unwrap().print_module(&module).unwrap();
        let func = text.find("def @cv22_0(").unwrap();
        let main = text.find("def @main(").unwrap();
        assert!(func < main);
        assert!(text.contains("Compiler=\"cv22\", global_symbol=\"cv22_0\""));
        assert!(text.contains("%cv22_0 = @cv22_0(%a, %b);"));
    }
}
