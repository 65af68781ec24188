//! Reference interpreter used to check that partitioning preserves values.

use crate::core::op::{attr_float, attr_int, Attrs};
use crate::core::types::TensorType;
use crate::ir::infer::{broadcast_shapes, infer_op, normalize_axis};
use crate::ir::{Graph, NodeKind, ValueRef};
use crate::partition::Function;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: &[usize], data: Vec<f32>) -> anyhow::Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(anyhow::anyhow!("{} values do not fill shape {:?}", data.len(), shape));
        }
        Ok(Self { shape: shape.to_vec(), data })
    }

    pub fn filled(shape: &[usize], value: f32) -> Self {
        Self { shape: shape.to_vec(), data: vec![value; shape.iter().product()] }
    }

    fn ty(&self) -> TensorType {
        TensorType::f32(&self.shape)
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor { shape: self.shape.clone(), data: self.data.iter().map(|&x| f(x)).collect() }
    }
}

/// Elementwise closeness with equal absolute and relative tolerance.
pub fn allclose(a: &Tensor, b: &Tensor, tol: f32) -> bool {
    a.shape == b.shape
        && a.data.iter().zip(&b.data).all(|(x, y)| (x - y).abs() <= tol + tol * y.abs())
}

/// Evaluates `graph` on named inputs, running calls through `functions`.
/// Results are keyed by output name.
pub fn evaluate(
    graph: &Graph,
    functions: &BTreeMap<String, Function>,
    inputs: &HashMap<String, Tensor>,
) -> anyhow::Result<BTreeMap<String, Tensor>> {
    let args = graph.input_names().iter()
        .map(|name| inputs.get(name).cloned().ok_or_else(|| anyhow::anyhow!("Missing input '{}'", name)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let results = run_graph(graph, functions, args)?;
    Ok(graph.output_names().into_iter().zip(results).collect())
}

fn run_graph(graph: &Graph, functions: &BTreeMap<String, Function>, args: Vec<Tensor>) -> anyhow::Result<Vec<Tensor>> {
    if args.len() != graph.inputs.len() {
        return Err(anyhow::anyhow!("'{}' expects {} inputs, got {}", graph.name, graph.inputs.len(), args.len()));
    }
    let mut values: HashMap<ValueRef, Tensor> = HashMap::new();
    for (&idx, arg) in graph.inputs.iter().zip(args) {
        values.insert(ValueRef::new(idx, 0), arg);
    }

    for idx in graph.topo_order()? {
        let node = graph.node(idx);
        let operands = graph.operand_values(idx).iter()
            .map(|v| values.get(v).cloned().ok_or_else(|| anyhow::anyhow!("'{}' reads an unset value", node.id)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let produced = match &node.kind {
            NodeKind::Input { .. } | NodeKind::Output { .. } => continue,
            NodeKind::Constant { ty, values } => vec![Tensor::new(&ty.shape, values.clone())?],
            NodeKind::Call { function, .. } => {
                let func = functions.get(function)
                    .ok_or_else(|| anyhow::anyhow!("Call '{}' targets unknown function '{}'", node.id, function))?;
                run_graph(&func.graph, functions, operands)?
            }
            NodeKind::Op { name, attrs, .. } => vec![
                eval_op(name, attrs, &operands).map_err(|e| anyhow::anyhow!("'{}' ({}): {}", node.id, name, e))?,
            ],
        };
        for (slot, t) in produced.into_iter().enumerate() {
            values.insert(ValueRef::new(idx, slot), t);
        }
    }

    graph.outputs.iter()
        .map(|&o| {
            graph.output_source(o)
                .and_then(|v| values.get(&v).cloned())
                .ok_or_else(|| anyhow::anyhow!("Output '{}' was not computed", graph.node(o).id))
        })
        .collect()
}

fn unary(name: &str) -> Option<fn(f32) -> f32> {
    let f: fn(f32) -> f32 = match name {
        "exp" => f32::exp,
        "log" => f32::ln,
        "sqrt" => f32::sqrt,
        "rsqrt" => |x| 1.0 / x.sqrt(),
        "sigmoid" => |x| 1.0 / (1.0 + (-x).exp()),
        "tanh" => f32::tanh,
        "nn.relu" => |x| x.max(0.0),
        "abs" => f32::abs,
        "negative" => |x| -x,
        "floor" => f32::floor,
        "ceil" => f32::ceil,
        "round" => f32::round,
        "trunc" => f32::trunc,
        "sign" => |x| if x > 0.0 { 1.0 } else if x < 0.0 { -1.0 } else { 0.0 },
        "copy" | "nn.dropout" => |x| x,
        _ => return None,
    };
    Some(f)
}

fn binary(name: &str) -> Option<fn(f32, f32) -> f32> {
    let f: fn(f32, f32) -> f32 = match name {
        "add" => |a, b| a + b,
        "subtract" => |a, b| a - b,
        "multiply" => |a, b| a * b,
        "divide" => |a, b| a / b,
        "maximum" => f32::max,
        "minimum" => f32::min,
        "power" => f32::powf,
        _ => return None,
    };
    Some(f)
}

fn eval_op(name: &str, attrs: &Attrs, args: &[Tensor]) -> anyhow::Result<Tensor> {
    let arg = |i: usize| args.get(i).ok_or_else(|| anyhow::anyhow!("missing operand {}", i));

    if let Some(f) = unary(name) {
        return Ok(arg(0)?.map(f));
    }
    if let Some(f) = binary(name) {
        return broadcast_binary(arg(0)?, arg(1)?, f);
    }

    match name {
        "clip" => {
            let lo = attr_float(attrs, "a_min", f64::NEG_INFINITY) as f32;
            let hi = attr_float(attrs, "a_max", f64::INFINITY) as f32;
            Ok(arg(0)?.map(|x| x.max(lo).min(hi)))
        }
        "nn.leaky_relu" => {
            let alpha = attr_float(attrs, "alpha", 0.01) as f32;
            Ok(arg(0)?.map(|x| if x >= 0.0 { x } else { alpha * x }))
        }
        "nn.bias_add" => {
            let (data, bias) = (arg(0)?, arg(1)?);
            let axis = normalize_axis(attr_int(attrs, "axis", 1), data.shape.len())?;
            let mut shape = vec![1; data.shape.len()];
            shape[axis] = bias.data.len();
            broadcast_binary(data, &Tensor::new(&shape, bias.data.clone())?, |a, b| a + b)
        }
        "nn.softmax" => softmax(arg(0)?, attr_int(attrs, "axis", -1)),
        "reshape" | "nn.batch_flatten" => {
            let data = arg(0)?;
            let ty = infer_op(name, attrs, &[data.ty()], 1)?
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no result shape"))?;
            Tensor::new(&ty.shape, data.data.clone())
        }
        "nn.dense" => dense(arg(0)?, arg(1)?),
        _ => Err(anyhow::anyhow!("no reference kernel")),
    }
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Offset into a tensor of `shape` for an index over the (right aligned) broadcast shape.
fn broadcast_offset(index: &[usize], shape: &[usize], strides: &[usize]) -> usize {
    let skip = index.len() - shape.len();
    shape.iter().enumerate()
        .map(|(i, &dim)| if dim == 1 { 0 } else { index[skip + i] * strides[i] })
        .sum()
}

fn broadcast_binary(a: &Tensor, b: &Tensor, f: fn(f32, f32) -> f32) -> anyhow::Result<Tensor> {
    if a.shape == b.shape {
        let data = a.data.iter().zip(&b.data).map(|(&x, &y)| f(x, y)).collect();
        return Ok(Tensor { shape: a.shape.clone(), data });
    }
    let out = broadcast_shapes(&a.ty(), &b.ty())?;
    let (sa, sb, so) = (strides(&a.shape), strides(&b.shape), strides(&out.shape));
    let mut index = vec![0; out.shape.len()];
    let data = (0..out.numel())
        .map(|flat| {
            let mut rem = flat;
            for (d, s) in so.iter().enumerate() {
                index[d] = rem / s;
                rem %= s;
            }
            f(a.data[broadcast_offset(&index, &a.shape, &sa)], b.data[broadcast_offset(&index, &b.shape, &sb)])
        })
        .collect();
    Ok(Tensor { shape: out.shape, data })
}

fn dense(data: &Tensor, weight: &Tensor) -> anyhow::Result<Tensor> {
    let (&k, rows) = data.shape.split_last().ok_or_else(|| anyhow::anyhow!("dense data has rank 0"))?;
    let (units, wk) = match weight.shape.as_slice() {
        [n, kk] => (*n, *kk),
        _ => return Err(anyhow::anyhow!("dense weight must be 2-D")),
    };
    if wk != k {
        return Err(anyhow::anyhow!("dense reduction mismatch {} vs {}", k, wk));
    }
    let batch: usize = rows.iter().product();
    let mut out: Vec<f32> = Vec::with_capacity(batch * units);
    for r in 0..batch {
        let row = &data.data[r * k..(r + 1) * k];
        for u in 0..units {
            let w = &weight.data[u * k..(u + 1) * k];
            out.push(row.iter().zip(w).map(|(x, y)| x * y).sum());
        }
    }
    let mut shape = rows.to_vec();
    shape.push(units);
    Tensor::new(&shape, out)
}

fn softmax(data: &Tensor, axis: i64) -> anyhow::Result<Tensor> {
    let axis = normalize_axis(axis, data.shape.len())?;
    let extent = data.shape[axis];
    let inner: usize = data.shape[axis + 1..].iter().product();
    let outer: usize = data.shape[..axis].iter().product();
    let mut out = data.data.clone();
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| o * extent * inner + j * inner + i;
            let max = (0..extent).map(|j| data.data[at(j)]).fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = (0..extent).map(|j| (data.data[at(j)] - max).exp()).sum();
            for j in 0..extent {
                out[at(j)] = (data.data[at(j)] - max).exp() / sum;
            }
        }
    }
    Tensor::new(&data.shape, out)
}
