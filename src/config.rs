//! Run configuration, read from a JSON file. Every field has a default.

use crate::export::splits::{SplitAttrs, DEFAULT_CNNGEN_FLAGS, DEFAULT_VAS_FLAGS};
use crate::export::ExportOptions;
use crate::merge::{CyclePolicy, MergeOptions};
use crate::registry::{Registry, CV22_BACKEND};
use crate::toolchain::{CommandCompiler, CompileSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_OUTPUT_FOLDER: &str = "/tmp/test_amba/prepare/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Registry used for annotation; also the tag of every region
    pub backend: String,
    pub target_arch: String,
    pub output_folder: PathBuf,
    pub cnngen_flags: String,
    pub vas_flags: String,
    pub calibration_seed: Option<u64>,
    pub on_cycle: CyclePolicy,
    /// External compiler; regions are only exported when absent
    pub compiler: Option<CommandCompiler>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: CV22_BACKEND.to_string(),
            target_arch: CV22_BACKEND.to_string(),
            output_folder: PathBuf::from(DEFAULT_OUTPUT_FOLDER),
            cnngen_flags: DEFAULT_CNNGEN_FLAGS.to_string(),
            vas_flags: DEFAULT_VAS_FLAGS.to_string(),
            calibration_seed: None,
            on_cycle: CyclePolicy::default(),
            compiler: None,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("Invalid config: {}", e))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {:?}: {}", path, e))?;
        Self::from_json(&content)
    }

    pub fn registry(&self) -> anyhow::Result<Registry> {
        Registry::for_backend(&self.backend)
            .ok_or_else(|| anyhow::anyhow!("No operator registry for backend '{}'", self.backend))
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions { on_cycle: self.on_cycle }
    }

    pub fn compile_settings(&self) -> CompileSettings {
        CompileSettings {
            target_arch: self.target_arch.clone(),
            output_dir: self.output_folder.clone(),
            export: ExportOptions {
                seed: self.calibration_seed,
                attr: SplitAttrs { cnngen_flags: self.cnngen_flags.clone(), vas_flags: self.vas_flags.clone() },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.registry().unwrap().backend(), "cv22");
        assert_eq!(config.compile_settings().output_dir, PathBuf::from("/tmp/test_amba/prepare/"));
    }

    #[test]
    fn fields_override_defaults() {
        let config = Config::from_json(r#"{
            "output_folder": "/work/out",
            "calibration_seed": 3,
            "on_cycle": "fail",
            "compiler": { "program": "cvflow-prepare", "timeout_secs": 60 }
        }"#).unwrap();
        assert_eq!(config.merge_options().on_cycle, CyclePolicy::Fail);
        let settings = config.compile_settings();
        assert_eq!(settings.export.seed, Some(3));
        assert_eq!(settings.export.attr.vas_flags, DEFAULT_VAS_FLAGS);
        let compiler = config.compiler.unwrap();
        assert_eq!(compiler.program, "cvflow-prepare");
        assert!(compiler.extra_args.is_empty());
    }

    #[test]
    fn unknown_backend_has_no_registry() {
        let config = Config::from_json(r#"{ "backend": "tpu" }"#).unwrap();
        assert!(config.registry().is_err());
    }
}
