use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An empty list carries no element type in JSON, so `Ints([])` and
/// `Floats([])` compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        use AttrValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Ints(a), Ints(b)) => a == b,
            (Floats(a), Floats(b)) => a == b,
            (Ints(i), Floats(f)) | (Floats(f), Ints(i)) => i.is_empty() && f.is_empty(),
            _ => false,
        }
    }
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<Vec<i64>> {
        match self {
            AttrValue::Ints(v) => Some(v.clone()),
            AttrValue::Int(v) => Some(vec![*v]),
            _ => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            AttrValue::Float(v) => v.is_finite(),
            AttrValue::Floats(v) => v.iter().all(|x| x.is_finite()),
            _ => true,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self { AttrValue::Int(v) }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self { AttrValue::Float(v) }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self { AttrValue::Str(v.to_string()) }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self { AttrValue::Bool(v) }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self { AttrValue::Ints(v) }
}

/// Operator attributes, ordered by name so printing and export are stable.
pub type Attrs = BTreeMap<String, AttrValue>;

pub fn attrs<const N: usize>(items: [(&str, AttrValue); N]) -> Attrs {
    items.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

pub fn attr_int(attrs: &Attrs, name: &str, default: i64) -> i64 {
    attrs.get(name).and_then(|v| v.as_int()).unwrap_or(default)
}

pub fn attr_float(attrs: &Attrs, name: &str, default: f64) -> f64 {
    attrs.get(name).and_then(|v| v.as_float()).unwrap_or(default)
}

pub fn attr_ints(attrs: &Attrs, name: &str) -> Option<Vec<i64>> {
    attrs.get(name).and_then(|v| v.as_ints())
}

/// Expands a 1-, 2- or 4-element list into (top, left, bottom, right) style pairs.
pub fn attr_pair(attrs: &Attrs, name: &str, default: i64) -> [i64; 2] {
    match attr_ints(attrs, name).as_deref() {
        Some([v]) => [*v, *v],
        Some([a, b, ..]) => [*a, *b],
        _ => [default, default],
    }
}

pub fn attr_padding(attrs: &Attrs) -> [i64; 4] {
    match attr_ints(attrs, "padding").as_deref() {
        Some([v]) => [*v; 4],
        Some([h, w]) => [*h, *w, *h, *w],
        Some([t, l, b, r]) => [*t, *l, *b, *r],
        _ => [0; 4],
    }
}
