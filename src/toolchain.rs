//! Hand-off of exported regions to the external compiler.

use crate::error::{ExportError, ExternalCompilationError};
use crate::export::{export_all, ExportOptions, ExportedRegion};
use crate::partition::PartitionedModule;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const OUTPUTS_ENV: &str = "CV22_OUTPUTS_LIST";
pub const ARTIFACT_SUFFIX: &str = "ambapb.ckpt.onnx";

#[derive(Debug, Clone, PartialEq)]
pub struct CompileJob {
    pub name: String,
    pub model_path: PathBuf,
    pub graph_desc_path: PathBuf,
    pub target_arch: String,
    pub output_name: String,
    pub output_dir: PathBuf,
    /// Primary output names of the region, passed through the environment
    pub outputs: Vec<String>,
}

impl CompileJob {
    pub fn for_region(region: &ExportedRegion, target_arch: &str, output_dir: &Path) -> Self {
        Self {
            name: region.name.clone(),
            model_path: region.model_path.clone(),
            graph_desc_path: region.graph_desc_path.clone(),
            target_arch: target_arch.to_string(),
            output_name: region.name.clone(),
            output_dir: output_dir.to_path_buf(),
            outputs: region.outputs.clone(),
        }
    }

    pub fn expected_artifact(&self) -> PathBuf {
        self.output_dir.join(format!("{}.{}", self.output_name, ARTIFACT_SUFFIX))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }
}

pub trait ExternalCompiler: Send + Sync {
    fn compile(&self, job: &CompileJob) -> Result<PathBuf, ExternalCompilationError>;
}

/// Runs a compiler program as a subprocess, one per region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandCompiler {
    pub program: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandCompiler {
    pub fn new(program: &str) -> Self {
        Self { program: program.to_string(), extra_args: Vec::new(), timeout_secs: None }
    }

    fn command(&self, job: &CompileJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .arg("--model").arg(&job.model_path)
            .arg("--graph-desc").arg(&job.graph_desc_path)
            .arg("--arch").arg(&job.target_arch)
            .arg("--output-name").arg(&job.output_name)
            .arg("--output-folder").arg(&job.output_dir)
            .arg("--log-dir").arg(job.log_dir())
            .env(OUTPUTS_ENV, job.outputs.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl ExternalCompiler for CommandCompiler {
    fn compile(&self, job: &CompileJob) -> Result<PathBuf, ExternalCompilationError> {
        let spawn_error = |source: std::io::Error| ExternalCompilationError::Spawn {
            region: job.name.clone(),
            program: self.program.clone(),
            source,
        };
        std::fs::create_dir_all(job.log_dir()).map_err(spawn_error)?;

        let mut child = self.command(job).spawn().map_err(spawn_error)?;

        // Drained on a side thread; a full pipe would stall the child.
        let stderr = child.stderr.take();
        let reader = std::thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text);
            }
            text
        });

        let deadline = self.timeout_secs.map(|s| (s, Instant::now() + Duration::from_secs(s)));
        let status = loop {
            match child.try_wait().map_err(spawn_error)? {
                Some(status) => break status,
                None => {
                    if let Some((secs, at)) = deadline {
                        if Instant::now() >= at {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(ExternalCompilationError::TimedOut { region: job.name.clone(), secs });
                        }
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        };
        let stderr = reader.join().unwrap_or_default();

        if !status.success() {
            return Err(ExternalCompilationError::Failed {
                region: job.name.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let artifact = job.expected_artifact();
        if !artifact.exists() {
            return Err(ExternalCompilationError::MissingArtifact { region: job.name.clone(), path: artifact });
        }
        Ok(artifact)
    }
}

/// Outcome for one region.
#[derive(Debug)]
pub enum RegionStatus {
    /// Exported; no compiler was configured
    Exported { model: PathBuf },
    Compiled { artifact: PathBuf },
    ExportFailed(ExportError),
    CompileFailed(ExternalCompilationError),
}

impl RegionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RegionStatus::Exported { .. } | RegionStatus::Compiled { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RegionStatus::Exported { .. } => "exported",
            RegionStatus::Compiled { .. } => "compiled",
            RegionStatus::ExportFailed(_) => "export failed",
            RegionStatus::CompileFailed(_) => "compile failed",
        }
    }
}

impl fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionStatus::Exported { model } => write!(f, "exported to {}", model.display()),
            RegionStatus::Compiled { artifact } => write!(f, "compiled to {}", artifact.display()),
            RegionStatus::ExportFailed(e) => write!(f, "export failed: {}", e),
            RegionStatus::CompileFailed(e) => write!(f, "compile failed: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileSettings {
    pub target_arch: String,
    pub output_dir: PathBuf,
    pub export: ExportOptions,
}

/// Compiles already exported regions in parallel; without a compiler every
/// region stays `Exported`.
pub fn compile_regions(
    regions: &BTreeMap<String, ExportedRegion>,
    settings: &CompileSettings,
    compiler: Option<&dyn ExternalCompiler>,
) -> BTreeMap<String, RegionStatus> {
    regions
        .par_iter()
        .map(|(name, region)| {
            let status = match compiler {
                None => RegionStatus::Exported { model: region.model_path.clone() },
                Some(compiler) => {
                    let job = CompileJob::for_region(region, &settings.target_arch, &settings.output_dir);
                    match compiler.compile(&job) {
                        Ok(artifact) => RegionStatus::Compiled { artifact },
                        Err(e) => RegionStatus::CompileFailed(e),
                    }
                }
            };
            log_status(name, &status);
            (name.clone(), status)
        })
        .collect()
}

fn log_status(name: &str, status: &RegionStatus) {
    if status.is_success() {
        info!(region = %name, "{}", status);
    } else {
        error!(region = %name, "{}", status);
    }
}

/// Exports and compiles every function of `module`. Regions never affect
/// each other: each gets its own status.
pub fn compile_all(
    module: &PartitionedModule,
    settings: &CompileSettings,
    compiler: Option<&dyn ExternalCompiler>,
) -> BTreeMap<String, RegionStatus> {
    let mut exported = BTreeMap::new();
    let mut statuses = BTreeMap::new();
    for (name, result) in export_all(module, &settings.output_dir, &settings.export) {
        match result {
            Ok(region) => {
                exported.insert(name, region);
            }
            Err(e) => {
                statuses.insert(name, RegionStatus::ExportFailed(e));
            }
        }
    }
    statuses.extend(compile_regions(&exported, settings, compiler));
    statuses
}

/// Record of compiled subgraphs, one artifact per function name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleManifest {
    pub subgraphs: BTreeMap<String, PathBuf>,
}

impl ModuleManifest {
    pub fn from_statuses(statuses: &BTreeMap<String, RegionStatus>) -> Self {
        let subgraphs = statuses.iter()
            .filter_map(|(name, status)| match status {
                RegionStatus::Compiled { artifact } => Some((name.clone(), artifact.clone())),
                _ => None,
            })
            .collect();
        Self { subgraphs }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .map_err(|e| anyhow::anyhow!("Failed to write manifest {:?}: {}", path, e))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read manifest {:?}: {}", path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}
