//! Error kinds raised by the partitioning pipeline.
//!
//! An unsupported operator is not an error: the registry just answers
//! `false`. Everything else that can go wrong is one of the enums below.
//! Partition errors abort the whole transformation; export and external
//! compilation errors are scoped to a single region.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartitionError {
    /// The input graph itself is not a DAG
    #[error("graph contains a cycle through node '{0}'")]
    CyclicGraph(String),

    /// Merging two regions would create a cycle once they are contracted
    #[error("merging region of '{left}' with region of '{right}' would create a cycle in the residual graph")]
    CyclicMerge { left: String, right: String },

    /// Contracting the merged regions produced a cyclic residual graph
    #[error("contracted residual graph is cyclic around region {0}")]
    CyclicResidual(String),

    /// A region references a value that is neither internal nor a parameter
    #[error("region {region} is not closed: value from '{node}' is not reachable")]
    NotClosed { region: String, node: String },

    /// Two generated functions ended up with the same name
    #[error("duplicate function name: {0}")]
    DuplicateFunction(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{function}: attribute '{attr}' of node '{node}' cannot be represented")]
    UnrepresentableAttr { function: String, node: String, attr: String },

    #[error("{function}: constant '{node}' holds non-finite values")]
    NonFiniteConstant { function: String, node: String },

    #[error("{function}: nested opaque call '{node}' cannot be exported")]
    NestedCall { function: String, node: String },

    #[error("{function}: type inference failed: {reason}")]
    UnknownType { function: String, reason: String },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExternalCompilationError {
    #[error("{region}: failed to launch '{program}': {source}")]
    Spawn {
        region: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{region}: compiler exited with {status}: {stderr}")]
    Failed { region: String, status: String, stderr: String },

    #[error("{region}: compiler timed out after {secs}s")]
    TimedOut { region: String, secs: u64 },

    #[error("{region}: compiled artifact not found at {path}")]
    MissingArtifact { region: String, path: PathBuf },
}

impl ExternalCompilationError {
    pub fn region(&self) -> &str {
        match self {
            ExternalCompilationError::Spawn { region, .. }
            | ExternalCompilationError::Failed { region, .. }
            | ExternalCompilationError::TimedOut { region, .. }
            | ExternalCompilationError::MissingArtifact { region, .. } => region,
        }
    }
}
