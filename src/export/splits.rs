//! Graph descriptor telling the toolchain how tensors bind to files.

use crate::core::types::{DataType, Port};
use crate::error::ExportError;
use crate::export::calibration::CalibrationEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CNNGEN_FLAGS: &str = "-c coeff-force-fx16,act-force-fx16";
pub const DEFAULT_VAS_FLAGS: &str = "-auto -v";
const VP_TYPE: &str = "ORCVP";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BeginEntry {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub file: PathBuf,
    pub extn: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EndEntry {
    pub dtype: DataType,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SplitAttrs {
    pub cnngen_flags: String,
    pub vas_flags: String,
}

impl Default for SplitAttrs {
    fn default() -> Self {
        Self { cnngen_flags: DEFAULT_CNNGEN_FLAGS.to_string(), vas_flags: DEFAULT_VAS_FLAGS.to_string() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Split {
    #[serde(rename = "type")]
    pub kind: String,
    pub begin: BTreeMap<String, BeginEntry>,
    pub end: BTreeMap<String, EndEntry>,
    pub attr: SplitAttrs,
}

/// One split per subgraph name.
pub type Splits = BTreeMap<String, Split>;

pub fn build_splits(name: &str, calibration: &[CalibrationEntry], inputs: &[Port], outputs: &[Port], attr: &SplitAttrs) -> Splits {
    let dtype_of = |input: &str| inputs.iter().find(|p| p.name == input).map(|p| p.dtype).unwrap_or_default();
    let begin = calibration.iter()
        .map(|c| (c.input.clone(), BeginEntry {
            shape: c.shape.clone(),
            dtype: dtype_of(&c.input),
            file: c.list_path.clone(),
            extn: "bin".to_string(),
        }))
        .collect();
    let end = outputs.iter().map(|p| (p.name.clone(), EndEntry { dtype: p.dtype })).collect();
    let split = Split { kind: VP_TYPE.to_string(), begin, end, attr: attr.clone() };
    BTreeMap::from([(name.to_string(), split)])
}

pub fn write_splits(splits: &Splits, name: &str, dir: &Path) -> Result<PathBuf, ExportError> {
    let path = dir.join(format!("{}_splits.json", name));
    let json = serde_json::to_string_pretty(splits)?;
    std::fs::write(&path, json).map_err(|source| ExportError::Io { path: path.clone(), source })?;
    Ok(path)
}
