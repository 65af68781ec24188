pub mod calibration;
pub mod splits;

use crate::core::types::Port;
use crate::error::ExportError;
use crate::ir::infer::infer_types;
use crate::ir::json::GraphDef;
use crate::ir::{Graph, NodeKind};
use crate::partition::{Function, PartitionedModule};
use calibration::{write_calibration, CalibrationEntry};
use rayon::prelude::*;
use splits::{build_splits, write_splits, SplitAttrs};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Closed, serialized form of one standalone graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub name: String,
    pub graph: GraphDef,
}

impl ExportArtifact {
    pub fn inputs(&self) -> &[Port] {
        &self.graph.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.graph.outputs
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.name))
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        let path = self.path_in(dir);
        let json = serde_json::to_string_pretty(&self.graph)?;
        std::fs::write(&path, json).map_err(|source| ExportError::Io { path: path.clone(), source })?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, ExportError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ExportError::Io { path: path.to_path_buf(), source })?;
        let graph: GraphDef = serde_json::from_str(&content)?;
        Ok(Self { name: graph.name.clone(), graph })
    }
}

/// Serializes a standalone graph under `name`.
pub fn export(graph: &Graph, name: &str) -> Result<ExportArtifact, ExportError> {
    for node in graph.graph.node_weights() {
        match &node.kind {
            NodeKind::Call { .. } => {
                return Err(ExportError::NestedCall { function: name.to_string(), node: node.id.clone() });
            }
            NodeKind::Op { attrs, .. } => {
                if let Some((attr, _)) = attrs.iter().find(|(_, v)| !v.is_finite()) {
                    return Err(ExportError::UnrepresentableAttr {
                        function: name.to_string(),
                        node: node.id.clone(),
                        attr: attr.clone(),
                    });
                }
            }
            NodeKind::Constant { values, .. } if values.iter().any(|v| !v.is_finite()) => {
                return Err(ExportError::NonFiniteConstant { function: name.to_string(), node: node.id.clone() });
            }
            _ => {}
        }
    }

    let unknown = |e: anyhow::Error| ExportError::UnknownType { function: name.to_string(), reason: e.to_string() };
    infer_types(graph).map_err(unknown)?;
    let mut def = GraphDef::from_graph(graph).map_err(unknown)?;
    def.name = name.to_string();
    Ok(ExportArtifact { name: name.to_string(), graph: def })
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Seed for calibration samples; random when unset
    pub seed: Option<u64>,
    pub attr: SplitAttrs,
}

/// Everything written to disk for one region.
#[derive(Debug, Clone)]
pub struct ExportedRegion {
    pub name: String,
    pub model_path: PathBuf,
    pub graph_desc_path: PathBuf,
    pub calibration: Vec<CalibrationEntry>,
    pub outputs: Vec<String>,
}

pub fn export_function(function: &Function, dir: &Path, options: &ExportOptions) -> Result<ExportedRegion, ExportError> {
    std::fs::create_dir_all(dir).map_err(|source| ExportError::Io { path: dir.to_path_buf(), source })?;

    let artifact = export(&function.graph, &function.name)?;
    let model_path = artifact.write(dir)?;
    let calibration = write_calibration(artifact.inputs(), dir, options.seed)?;
    let splits = build_splits(&function.name, &calibration, artifact.inputs(), artifact.outputs(), &options.attr);
    let graph_desc_path = write_splits(&splits, &function.name, dir)?;

    debug!(function = %function.name, model = %model_path.display(), "exported");
    Ok(ExportedRegion {
        name: function.name.clone(),
        model_path,
        graph_desc_path,
        calibration,
        outputs: artifact.outputs().iter().map(|p| p.name.clone()).collect(),
    })
}

/// Exports every function independently; one failure does not stop the others.
pub fn export_all(
    module: &PartitionedModule,
    dir: &Path,
    options: &ExportOptions,
) -> BTreeMap<String, Result<ExportedRegion, ExportError>> {
    module.functions
        .par_iter()
        .map(|(name, function)| {
            let result = export_function(function, dir, options);
            if let Err(e) = &result {
                warn!(function = %name, error = %e, "export failed");
            }
            (name.clone(), result)
        })
        .collect()
}
