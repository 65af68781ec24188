use crate::core::op::{attr_int, attr_ints, attr_pair, attr_padding, Attrs};
use crate::core::types::{DataType, TensorType};
use crate::ir::{Graph, NodeKind, ValueRef};
use std::collections::HashMap;
use tracing::debug;

pub type TypeMap = HashMap<ValueRef, TensorType>;

/// Infers the type of every value produced in `graph`.
pub fn infer_types(graph: &Graph) -> anyhow::Result<TypeMap> {
    infer_with(graph, true)
}

/// Like [`infer_types`], but a node that cannot be typed (or that consumes an
/// untyped value) is left out of the map instead of failing the whole graph.
pub fn infer_types_partial(graph: &Graph) -> anyhow::Result<TypeMap> {
    infer_with(graph, false)
}

fn infer_with(graph: &Graph, strict: bool) -> anyhow::Result<TypeMap> {
    let mut types = TypeMap::new();
    let order = graph.topo_order()?;

    for idx in order {
        let node = graph.node(idx);
        let mut inputs = Vec::new();
        for v in graph.operand_values(idx) {
            match types.get(&v) {
                Some(ty) => inputs.push(ty.clone()),
                None if strict => return Err(anyhow::anyhow!("Missing type for operand of '{}'", node.id)),
                None => break,
            }
        }
        if inputs.len() != graph.operand_values(idx).len() {
            debug!(node = %node.id, "operand untyped, skipping");
            continue;
        }

        let produced = match &node.kind {
            NodeKind::Input { ty, .. } | NodeKind::Constant { ty, .. } => vec![ty.clone()],
            NodeKind::Call { results, .. } => results.clone(),
            NodeKind::Output { .. } => vec![],
            NodeKind::Op { name, attrs, num_outputs } => {
                let out = infer_op(name, attrs, &inputs, *num_outputs)
                    .map_err(|e| anyhow::anyhow!("Type inference failed at '{}' ({}): {}", node.id, name, e))
                    .and_then(|out| if out.len() == *num_outputs {
                        Ok(out)
                    } else {
                        Err(anyhow::anyhow!("'{}' produces {} values but declares {}", node.id, out.len(), num_outputs))
                    });
                match out {
                    Ok(out) => out,
                    Err(e) if strict => return Err(e),
                    Err(e) => {
                        debug!(node = %node.id, error = %e, "left untyped");
                        continue;
                    }
                }
            }
        };

        for (slot, ty) in produced.into_iter().enumerate() {
            types.insert(ValueRef::new(idx, slot), ty);
        }
    }
    Ok(types)
}

/// Types of the operands of one node, in slot order, for nodes whose
/// producers have already been typed.
pub fn operand_types(graph: &Graph, types: &TypeMap, idx: petgraph::graph::NodeIndex) -> Vec<TensorType> {
    graph.operand_values(idx).iter().filter_map(|v| types.get(v).cloned()).collect()
}

pub fn infer_op(name: &str, attrs: &Attrs, inputs: &[TensorType], num_outputs: usize) -> anyhow::Result<Vec<TensorType>> {
    let first = || inputs.first().cloned().ok_or_else(|| anyhow::anyhow!("operator needs at least one operand"));

    let single = match name {
        "add" | "subtract" | "multiply" | "divide" | "maximum" | "minimum" | "power" | "mod" | "floor_divide" => {
            broadcast_all(inputs)?
        }
        "equal" | "not_equal" | "less" | "less_equal" | "greater" | "greater_equal" => {
            TensorType { dtype: DataType::Bool, ..broadcast_all(inputs)? }
        }
        "nn.conv2d" => conv2d(attrs, inputs)?,
        "nn.conv2d_transpose" => conv2d_transpose(attrs, inputs)?,
        "nn.dense" => {
            let (data, weight) = two(inputs)?;
            let mut shape = data.shape.clone();
            let units = *weight.shape.first().ok_or_else(|| anyhow::anyhow!("dense weight has rank 0"))?;
            *shape.last_mut().ok_or_else(|| anyhow::anyhow!("dense data has rank 0"))? = units;
            TensorType { shape, dtype: data.dtype }
        }
        "nn.max_pool2d" | "nn.avg_pool2d" => pool2d(attrs, &first()?)?,
        "nn.global_max_pool2d" | "nn.global_avg_pool2d" => {
            let data = first()?;
            nchw(&data)?;
            TensorType { shape: vec![data.shape[0], data.shape[1], 1, 1], dtype: data.dtype }
        }
        "nn.batch_flatten" => {
            let data = first()?;
            let n = *data.shape.first().unwrap_or(&1);
            let rest = data.shape.iter().skip(1).product();
            TensorType { shape: vec![n, rest], dtype: data.dtype }
        }
        "reshape" => reshape(attrs, &first()?)?,
        "reshape_like" => {
            let (data, like) = two(inputs)?;
            TensorType { shape: like.shape.clone(), dtype: data.dtype }
        }
        "transpose" => {
            let data = first()?;
            let axes = attr_ints(attrs, "axes")
                .map(|a| a.iter().map(|&x| normalize_axis(x, data.rank())).collect::<anyhow::Result<Vec<_>>>())
                .transpose()?
                .unwrap_or_else(|| (0..data.rank()).rev().collect());
            if axes.len() != data.rank() {
                return Err(anyhow::anyhow!("transpose axes {:?} do not match rank {}", axes, data.rank()));
            }
            TensorType { shape: axes.iter().map(|&a| data.shape[a]).collect(), dtype: data.dtype }
        }
        "concatenate" => {
            let base = first()?;
            let axis = normalize_axis(attr_int(attrs, "axis", 0), base.rank())?;
            let mut shape = base.shape.clone();
            shape[axis] = 0;
            for ty in inputs {
                if ty.rank() != base.rank() {
                    return Err(anyhow::anyhow!("concatenate rank mismatch"));
                }
                shape[axis] += ty.shape[axis];
            }
            TensorType { shape, dtype: base.dtype }
        }
        "expand_dims" => {
            let data = first()?;
            let axis = normalize_axis(attr_int(attrs, "axis", 0), data.rank() + 1)?;
            let count = attr_int(attrs, "num_newaxis", 1).max(0) as usize;
            let mut shape = data.shape.clone();
            for _ in 0..count {
                shape.insert(axis, 1);
            }
            TensorType { shape, dtype: data.dtype }
        }
        "squeeze" => {
            let data = first()?;
            let shape = match attr_ints(attrs, "axis") {
                Some(axes) => {
                    let axes = axes.iter().map(|&a| normalize_axis(a, data.rank())).collect::<anyhow::Result<Vec<_>>>()?;
                    data.shape.iter().enumerate().filter(|(i, _)| !axes.contains(i)).map(|(_, d)| *d).collect()
                }
                None => data.shape.iter().copied().filter(|&d| d != 1).collect(),
            };
            TensorType { shape, dtype: data.dtype }
        }
        "sum" | "mean" | "max" | "min" | "prod" => reduce(attrs, &first()?)?,
        "argmax" | "argmin" => TensorType { dtype: DataType::I32, ..reduce(attrs, &first()?)? },
        "cast" => {
            let data = first()?;
            let dtype = match attrs.get("dtype").and_then(|v| v.as_str()) {
                Some(name) => DataType::parse(name)?,
                None => data.dtype,
            };
            TensorType { shape: data.shape, dtype }
        }
        "broadcast_to" => {
            let data = first()?;
            let target = attr_ints(attrs, "shape").ok_or_else(|| anyhow::anyhow!("broadcast_to needs 'shape'"))?;
            let target = TensorType { shape: to_dims(&target)?, dtype: data.dtype };
            broadcast_shapes(&data, &target)?
        }
        "zeros" | "ones" | "full" => {
            let shape = attr_ints(attrs, "shape").ok_or_else(|| anyhow::anyhow!("{} needs 'shape'", name))?;
            let dtype = attrs.get("dtype").and_then(|v| v.as_str()).map(DataType::parse).transpose()?.unwrap_or_default();
            TensorType { shape: to_dims(&shape)?, dtype }
        }
        "strided_slice" => strided_slice(attrs, &first()?)?,
        "split" => return split(attrs, &first()?, num_outputs),
        "nn.batch_norm" => {
            // normalized data, then the per-channel statistics
            let data = first()?;
            let stats = inputs.get(1).cloned().unwrap_or_else(|| data.clone());
            let mut out = vec![data];
            out.extend(std::iter::repeat_n(stats, num_outputs.saturating_sub(1)));
            return Ok(out);
        }
        // Everything else is shape-preserving on its first operand.
        _ => return Ok(vec![first()?; num_outputs]),
    };
    Ok(vec![single])
}

fn two(inputs: &[TensorType]) -> anyhow::Result<(&TensorType, &TensorType)> {
    match inputs {
        [a, b, ..] => Ok((a, b)),
        _ => Err(anyhow::anyhow!("operator needs two operands, got {}", inputs.len())),
    }
}

fn nchw(ty: &TensorType) -> anyhow::Result<[usize; 4]> {
    match ty.shape.as_slice() {
        [n, c, h, w] => Ok([*n, *c, *h, *w]),
        _ => Err(anyhow::anyhow!("expected a rank-4 NCHW tensor, got {}", ty)),
    }
}

fn to_dims(values: &[i64]) -> anyhow::Result<Vec<usize>> {
    values.iter()
        .map(|&v| usize::try_from(v).map_err(|_| anyhow::anyhow!("negative dimension {}", v)))
        .collect()
}

pub fn normalize_axis(axis: i64, rank: usize) -> anyhow::Result<usize> {
    let resolved = if axis < 0 { rank as i64 + axis } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(anyhow::anyhow!("axis {} out of range for rank {}", axis, rank));
    }
    Ok(resolved as usize)
}

fn broadcast_all(inputs: &[TensorType]) -> anyhow::Result<TensorType> {
    let (head, rest) = inputs.split_first().ok_or_else(|| anyhow::anyhow!("operator needs operands"))?;
    rest.iter().try_fold(head.clone(), |acc, next| broadcast_shapes(&acc, next))
}

/// Numpy-style broadcasting of two tensor types.
pub fn broadcast_shapes(a: &TensorType, b: &TensorType) -> anyhow::Result<TensorType> {
    let len_a = a.shape.len();
    let len_b = b.shape.len();
    let max_len = std::cmp::max(len_a, len_b);
    let mut out_dims = Vec::with_capacity(max_len);

    for i in 0..max_len {
        let dim_a = if i < max_len - len_a { 1 } else { a.shape[i - (max_len - len_a)] };
        let dim_b = if i < max_len - len_b { 1 } else { b.shape[i - (max_len - len_b)] };
        if dim_a == dim_b || dim_b == 1 {
            out_dims.push(dim_a);
        } else if dim_a == 1 {
            out_dims.push(dim_b);
        } else {
            return Err(anyhow::anyhow!("Shape mismatch for broadcast: {} and {}", a, b));
        }
    }
    Ok(TensorType { shape: out_dims, dtype: a.dtype })
}

fn window_out(size: usize, pad: i64, kernel: usize, stride: usize, dilation: usize, ceil_mode: bool) -> anyhow::Result<usize> {
    let effective = (kernel.saturating_sub(1)) * dilation + 1;
    let padded = size as i64 + pad;
    if padded < effective as i64 || stride == 0 {
        return Err(anyhow::anyhow!("window {} does not fit input {} (padding {})", effective, size, pad));
    }
    let span = (padded - effective as i64) as usize;
    let steps = if ceil_mode { span.div_ceil(stride) } else { span / stride };
    Ok(steps + 1)
}

fn conv2d(attrs: &Attrs, inputs: &[TensorType]) -> anyhow::Result<TensorType> {
    let (data, weight) = two(inputs)?;
    let [n, c, h, w] = nchw(data)?;
    let [o, i, kh, kw] = nchw(weight)?;
    let groups = attr_int(attrs, "groups", 1).max(1) as usize;
    if i * groups != c {
        return Err(anyhow::anyhow!("conv2d channels {} do not match weight {} x groups {}", c, i, groups));
    }
    let [pt, pl, pb, pr] = attr_padding(attrs);
    let [sh, sw] = attr_pair(attrs, "strides", 1);
    let [dh, dw] = attr_pair(attrs, "dilation", 1);
    let oh = window_out(h, pt + pb, kh, sh as usize, dh as usize, false)?;
    let ow = window_out(w, pl + pr, kw, sw as usize, dw as usize, false)?;
    Ok(TensorType { shape: vec![n, o, oh, ow], dtype: data.dtype })
}

fn conv2d_transpose(attrs: &Attrs, inputs: &[TensorType]) -> anyhow::Result<TensorType> {
    let (data, weight) = two(inputs)?;
    let [n, _, h, w] = nchw(data)?;
    // IOHW weight layout
    let [_, o, kh, kw] = nchw(weight)?;
    let groups = attr_int(attrs, "groups", 1).max(1) as usize;
    let [pt, pl, pb, pr] = attr_padding(attrs);
    let [sh, sw] = attr_pair(attrs, "strides", 1);
    let [dh, dw] = attr_pair(attrs, "dilation", 1);
    let [oph, opw] = attr_pair(attrs, "output_padding", 0);
    let out = |size: usize, s: i64, d: i64, k: usize, pad: i64, op: i64| -> anyhow::Result<usize> {
        let v = (size as i64 - 1) * s - pad + (k as i64 - 1) * d + 1 + op;
        usize::try_from(v).map_err(|_| anyhow::anyhow!("conv2d_transpose produces a negative extent"))
    };
    Ok(TensorType {
        shape: vec![n, o * groups, out(h, sh, dh, kh, pt + pb, oph)?, out(w, sw, dw, kw, pl + pr, opw)?],
        dtype: data.dtype,
    })
}

fn pool2d(attrs: &Attrs, data: &TensorType) -> anyhow::Result<TensorType> {
    let [n, c, h, w] = nchw(data)?;
    let [kh, kw] = attr_pair(attrs, "pool_size", 1);
    let [sh, sw] = attr_pair(attrs, "strides", 1);
    let [pt, pl, pb, pr] = attr_padding(attrs);
    let ceil_mode = matches!(attrs.get("ceil_mode"), Some(crate::core::op::AttrValue::Bool(true)));
    let oh = window_out(h, pt + pb, kh as usize, sh as usize, 1, ceil_mode)?;
    let ow = window_out(w, pl + pr, kw as usize, sw as usize, 1, ceil_mode)?;
    Ok(TensorType { shape: vec![n, c, oh, ow], dtype: data.dtype })
}

fn reshape(attrs: &Attrs, data: &TensorType) -> anyhow::Result<TensorType> {
    let newshape = attr_ints(attrs, "newshape").ok_or_else(|| anyhow::anyhow!("reshape needs 'newshape'"))?;
    let mut dims = Vec::with_capacity(newshape.len());
    let mut wildcard = None;
    for (i, &d) in newshape.iter().enumerate() {
        match d {
            0 => dims.push(*data.shape.get(i).ok_or_else(|| anyhow::anyhow!("reshape copies missing dim {}", i))?),
            -1 if wildcard.is_none() => {
                wildcard = Some(i);
                dims.push(1);
            }
            d if d > 0 => dims.push(d as usize),
            _ => return Err(anyhow::anyhow!("unsupported reshape dimension {}", d)),
        }
    }
    let known: usize = dims.iter().product();
    if let Some(i) = wildcard {
        if known == 0 || data.numel() % known != 0 {
            return Err(anyhow::anyhow!("cannot infer -1 in reshape of {}", data));
        }
        dims[i] = data.numel() / known;
    }
    if dims.iter().product::<usize>() != data.numel() {
        return Err(anyhow::anyhow!("reshape {:?} changes element count of {}", newshape, data));
    }
    Ok(TensorType { shape: dims, dtype: data.dtype })
}

fn reduce(attrs: &Attrs, data: &TensorType) -> anyhow::Result<TensorType> {
    let keepdims = matches!(attrs.get("keepdims"), Some(crate::core::op::AttrValue::Bool(true)));
    let axes: Vec<usize> = match attr_ints(attrs, "axis") {
        Some(axes) => axes.iter().map(|&a| normalize_axis(a, data.rank())).collect::<anyhow::Result<_>>()?,
        None => (0..data.rank()).collect(),
    };
    let shape = data.shape.iter().enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keepdims) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    Ok(TensorType { shape, dtype: data.dtype })
}

fn strided_slice(attrs: &Attrs, data: &TensorType) -> anyhow::Result<TensorType> {
    let begin = attr_ints(attrs, "begin").unwrap_or_default();
    let end = attr_ints(attrs, "end").unwrap_or_default();
    let strides = attr_ints(attrs, "strides").unwrap_or_default();
    let mut shape = data.shape.clone();
    for (axis, extent) in shape.iter_mut().enumerate() {
        let full = *extent as i64;
        let clamp = |v: i64| if v < 0 { (full + v).max(0) } else { v.min(full) };
        let b = begin.get(axis).map(|&v| clamp(v)).unwrap_or(0);
        let e = end.get(axis).map(|&v| clamp(v)).unwrap_or(full);
        let s = strides.get(axis).copied().unwrap_or(1);
        if s <= 0 {
            return Err(anyhow::anyhow!("only positive strides are supported"));
        }
        *extent = if e > b { ((e - b + s - 1) / s) as usize } else { 0 };
    }
    Ok(TensorType { shape, dtype: data.dtype })
}

fn split(attrs: &Attrs, data: &TensorType, num_outputs: usize) -> anyhow::Result<Vec<TensorType>> {
    let axis = normalize_axis(attr_int(attrs, "axis", 0), data.rank())?;
    let extent = data.shape[axis];
    let bounds: Vec<usize> = match attrs.get("indices_or_sections") {
        Some(crate::core::op::AttrValue::Ints(indices)) => {
            let mut b = to_dims(indices)?;
            b.push(extent);
            b
        }
        Some(v) => {
            let sections = v.as_int().unwrap_or(num_outputs as i64).max(1) as usize;
            if extent % sections != 0 {
                return Err(anyhow::anyhow!("split of {} into {} sections is uneven", extent, sections));
            }
            (1..=sections).map(|i| i * extent / sections).collect()
        }
        None => (1..=num_outputs).map(|i| i * extent / num_outputs.max(1)).collect(),
    };
    let mut start = 0;
    let mut out = Vec::with_capacity(bounds.len());
    for end in bounds {
        let mut shape = data.shape.clone();
        shape[axis] = end.saturating_sub(start);
        out.push(TensorType { shape, dtype: data.dtype });
        start = end;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::{attrs, AttrValue};

    #[test]
    fn conv2d_same_padding_keeps_spatial_dims() {
        let data = TensorType::f32(&[1, 3, 224, 224]);
        let weight = TensorType::f32(&[32, 3, 3, 3]);
        let a = attrs([("padding", AttrValue::Ints(vec![1, 1])), ("kernel_size", AttrValue::Ints(vec![3, 3]))]);
        let out = infer_op("nn.conv2d", &a, &[data, weight], 1).unwrap();
        assert_eq!(out[0].shape, vec![1, 32, 224, 224]);
    }

    #[test]
    fn depthwise_conv_respects_groups() {
        let data = TensorType::f32(&[1, 32, 14, 14]);
        let weight = TensorType::f32(&[32, 1, 3, 3]);
        let a = attrs([("padding", AttrValue::Ints(vec![1, 1])), ("groups", 32i64.into())]);
        let out = infer_op("nn.conv2d", &a, &[data.clone(), weight.clone()], 1).unwrap();
        assert_eq!(out[0].shape, vec![1, 32, 14, 14]);
        assert!(infer_op("nn.conv2d", &Attrs::new(), &[data, weight], 1).is_err());
    }

    #[test]
    fn broadcasting_follows_numpy_rules() {
        let a = TensorType::f32(&[4, 1, 3]);
        let b = TensorType::f32(&[2, 1]);
        assert_eq!(broadcast_shapes(&a, &b).unwrap().shape, vec![4, 2, 3]);
        assert!(broadcast_shapes(&TensorType::f32(&[2]), &TensorType::f32(&[3])).is_err());
    }

    #[test]
    fn reshape_infers_wildcard() {
        let a = attrs([("newshape", AttrValue::Ints(vec![0, -1]))]);
        let out = infer_op("reshape", &a, &[TensorType::f32(&[2, 3, 4])], 1).unwrap();
        assert_eq!(out[0].shape, vec![2, 12]);
    }

    #[test]
    fn split_produces_each_section() {
        let a = attrs([("indices_or_sections", 3i64.into()), ("axis", 1i64.into())]);
        let out = infer_op("split", &a, &[TensorType::f32(&[1, 6])], 3).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|t| t.shape == vec![1, 2]));
    }

    #[test]
    fn unknown_ops_repeat_their_first_operand() {
        let x = TensorType::f32(&[1, 4]);
        let out = infer_op("vendor.topk", &Attrs::new(), &[x.clone()], 2).unwrap();
        assert_eq!(out, vec![x.clone(), x]);
        assert!(infer_op("vendor.source", &Attrs::new(), &[], 1).is_err());
    }

    #[test]
    fn batch_norm_yields_channel_statistics() {
        let data = TensorType::f32(&[1, 8, 2, 2]);
        let stat = TensorType::f32(&[8]);
        let args = [data.clone(), stat.clone(), stat.clone(), stat.clone(), stat.clone()];
        let out = infer_op("nn.batch_norm", &Attrs::new(), &args, 3).unwrap();
        assert_eq!(out, vec![data, stat.clone(), stat]);
    }

    #[test]
    fn scalar_axes_are_rejected() {
        let scalar = TensorType::f32(&[]);
        assert!(infer_op("concatenate", &Attrs::new(), &[scalar.clone(), scalar.clone()], 1).is_err());
        assert!(infer_op("split", &attrs([("indices_or_sections", 2i64.into())]), &[scalar.clone()], 2).is_err());
        assert_eq!(infer_op("expand_dims", &Attrs::new(), &[scalar], 1).unwrap()[0].shape, vec![1]);
    }

    #[test]
    fn reductions_drop_or_keep_axes() {
        let data = TensorType::f32(&[2, 3, 4]);
        let drop = attrs([("axis", AttrValue::Ints(vec![1]))]);
        assert_eq!(infer_op("sum", &drop, &[data.clone()], 1).unwrap()[0].shape, vec![2, 4]);
        let keep = attrs([("axis", AttrValue::Ints(vec![-1])), ("keepdims", true.into())]);
        assert_eq!(infer_op("mean", &keep, &[data.clone()], 1).unwrap()[0].shape, vec![2, 3, 1]);
        assert_eq!(infer_op("argmax", &Attrs::new(), &[data], 1).unwrap()[0].dtype, DataType::I32);
    }

    #[test]
    fn unknown_ops_preserve_first_operand() {
        let out = infer_op("vendor.custom", &Attrs::new(), &[TensorType::f32(&[5])], 1).unwrap();
        assert_eq!(out[0], TensorType::f32(&[5]));
        assert!(infer_op("vendor.custom", &Attrs::new(), &[], 1).is_err());
    }
}
