use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "bool")]
    Bool,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::F32 => "float32",
            DataType::F64 => "float64",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::U8 => "uint8",
            DataType::Bool => "bool",
        }
    }

    pub fn parse(name: &str) -> anyhow::Result<Self> {
        match name {
            "float32" => Ok(DataType::F32),
            "float64" => Ok(DataType::F64),
            "int32" => Ok(DataType::I32),
            "int64" => Ok(DataType::I64),
            "uint8" => Ok(DataType::U8),
            "bool" => Ok(DataType::Bool),
            _ => Err(anyhow::anyhow!("Unknown dtype: {}", name)),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static tensor type of a single value flowing along an edge.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dtype: DataType,
}

impl TensorType {
    pub fn new(shape: &[usize], dtype: DataType) -> Self {
        Self { shape: shape.to_vec(), dtype }
    }

    pub fn f32(shape: &[usize]) -> Self {
        Self::new(shape, DataType::F32)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self.shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ");
        write!(f, "Tensor[({}), {}]", dims, self.dtype)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl Port {
    pub fn new(name: &str, ty: &TensorType) -> Self {
        Self { name: name.to_string(), shape: ty.shape.clone(), dtype: ty.dtype }
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType { shape: self.shape.clone(), dtype: self.dtype }
    }
}
