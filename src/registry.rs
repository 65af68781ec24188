//! Operator support tables.
//!
//! A registry answers whether a backend claims an operator. Operators that
//! have no entry are simply unsupported.

use crate::core::op::Attrs;
use crate::core::types::TensorType;
use std::collections::BTreeMap;

pub type Predicate = fn(&Attrs, &[TensorType]) -> bool;

#[derive(Clone, Copy)]
pub enum Support {
    Fixed(bool),
    Check(Predicate),
}

impl Support {
    fn eval(&self, attrs: &Attrs, args: &[TensorType]) -> bool {
        match self {
            Support::Fixed(v) => *v,
            Support::Check(f) => f(attrs, args),
        }
    }
}

impl std::fmt::Debug for Support {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Support::Fixed(v) => write!(f, "Fixed({})", v),
            Support::Check(_) => f.write_str("Check(..)"),
        }
    }
}

pub const CV22_BACKEND: &str = "cv22";

/// Operators offloaded to CV22. `mod` is left out until it can be lowered.
pub const CV22_OPS: &[&str] = &[
    // elementwise math
    "log", "sqrt", "rsqrt", "exp", "sigmoid", "tanh",
    "add", "subtract", "multiply", "divide",
    "maximum", "minimum", "power",
    "floor", "ceil", "sign", "trunc", "round", "abs", "negative", "clip",
    // nn
    "nn.softmax", "nn.log_softmax", "nn.relu", "nn.leaky_relu", "nn.prelu",
    "nn.dropout", "nn.batch_norm", "nn.bias_add",
    "nn.conv2d", "nn.conv2d_transpose", "nn.contrib_conv2d_winograd_without_weight_transform",
    "nn.dense",
    "nn.max_pool2d", "nn.avg_pool2d", "nn.global_max_pool2d", "nn.global_avg_pool2d",
    "nn.upsampling", "nn.batch_flatten", "nn.pad", "nn.lrn", "nn.l2_normalize",
    // layout and shape
    "concatenate", "expand_dims", "reshape", "reshape_like", "copy", "transpose", "squeeze",
    "take", "gather_nd", "cast", "reinterpret", "split", "stack", "repeat", "tile", "reverse",
    "strided_slice", "broadcast_to",
    // constructors
    "zeros", "zeros_like", "ones", "ones_like", "full", "full_like", "arange",
    // reductions
    "argmax", "argmin", "sum", "max", "min", "mean", "prod",
];

#[derive(Debug, Clone)]
pub struct Registry {
    backend: String,
    entries: BTreeMap<String, Support>,
}

impl Registry {
    pub fn new(backend: &str) -> Self {
        Self { backend: backend.to_string(), entries: BTreeMap::new() }
    }

    pub fn cv22() -> Self {
        CV22_OPS.iter().fold(Self::new(CV22_BACKEND), |reg, op| reg.with_fixed(op, true))
    }

    /// Built-in registry for a backend name, if there is one.
    pub fn for_backend(backend: &str) -> Option<Self> {
        match backend {
            CV22_BACKEND => Some(Self::cv22()),
            _ => None,
        }
    }

    pub fn with_op(mut self, name: &str, predicate: Predicate) -> Self {
        self.entries.insert(name.to_string(), Support::Check(predicate));
        self
    }

    pub fn with_fixed(mut self, name: &str, supported: bool) -> Self {
        self.entries.insert(name.to_string(), Support::Fixed(supported));
        self
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn is_supported(&self, op: &str, attrs: &Attrs, args: &[TensorType]) -> bool {
        self.entries.get(op).map(|s| s.eval(attrs, args)).unwrap_or(false)
    }

    /// Names with an entry, whether or not it evaluates to true.
    pub fn operators(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::{attrs, AttrValue};

    #[test]
    fn cv22_claims_listed_ops_only() {
        let reg = Registry::cv22();
        let args = [TensorType::f32(&[1, 2]), TensorType::f32(&[1, 2])];
        assert!(reg.is_supported("multiply", &Attrs::new(), &args));
        assert!(reg.is_supported("nn.conv2d", &Attrs::new(), &args));
        assert!(reg.is_supported("nn.bias_add", &Attrs::new(), &args));
        assert!(!reg.is_supported("mod", &Attrs::new(), &args));
        assert!(!reg.is_supported("vendor.unknown", &Attrs::new(), &args));
        assert_eq!(reg.backend(), "cv22");
    }

    #[test]
    fn predicates_can_inspect_attrs_and_args() {
        fn only_grouped(attrs: &Attrs, args: &[TensorType]) -> bool {
            attrs.get("groups").and_then(|g| g.as_int()).unwrap_or(1) == 1
                && args.first().map(|t| t.rank() == 4).unwrap_or(false)
        }
        let reg = Registry::new("acc").with_op("nn.conv2d", only_grouped).with_fixed("add", false);
        let nchw = [TensorType::f32(&[1, 3, 8, 8])];
        assert!(reg.is_supported("nn.conv2d", &Attrs::new(), &nchw));
        assert!(!reg.is_supported("nn.conv2d", &attrs([("groups", AttrValue::Int(3))]), &nchw));
        assert!(!reg.is_supported("nn.conv2d", &Attrs::new(), &[TensorType::f32(&[3])]));
        assert!(!reg.is_supported("add", &Attrs::new(), &nchw));
        assert_eq!(reg.operators().collect::<Vec<_>>(), ["add", "nn.conv2d"]);
    }

    #[test]
    fn lookup_by_backend_name() {
        assert!(Registry::for_backend("cv22").is_some());
        assert!(Registry::for_backend("dnnl").is_none());
    }
}
