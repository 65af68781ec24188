use crate::annotate::annotate;
use crate::config::Config;
use crate::export::{export_all, ExportedRegion};
use crate::ir::Graph;
use crate::merge::{merge, MergedGraph};
use crate::partition::{partition, PartitionedModule};
use crate::registry::Registry;
use crate::toolchain::{compile_regions, ExternalCompiler, RegionStatus};
use std::collections::BTreeMap;
use tracing::info;

pub struct PartitionContext {
    pub graph: Graph,
    pub config: Config,
    pub registry: Registry,

    pub annotated: Option<Graph>,
    pub merged: Option<MergedGraph>,
    pub module: Option<PartitionedModule>,
    pub exported: BTreeMap<String, ExportedRegion>,
    pub statuses: BTreeMap<String, RegionStatus>,
}

impl PartitionContext {
    pub fn new(graph: Graph, config: Config) -> anyhow::Result<Self> {
        let registry = config.registry()?;
        Ok(Self {
            graph,
            config,
            registry,
            annotated: None,
            merged: None,
            module: None,
            exported: BTreeMap::new(),
            statuses: BTreeMap::new(),
        })
    }
}

fn missing(stage: &str, what: &str) -> anyhow::Error {
    anyhow::anyhow!("Stage '{}' needs {} from an earlier stage", stage, what)
}

pub trait Stage {
    fn name(&self) -> &str;
    fn run(&self, ctx: &mut PartitionContext) -> anyhow::Result<()>;
}

pub struct AnnotateStage;

impl Stage for AnnotateStage {
    fn name(&self) -> &str { "annotate" }

    fn run(&self, ctx: &mut PartitionContext) -> anyhow::Result<()> {
        ctx.annotated = Some(annotate(&ctx.graph, &ctx.registry)?);
        Ok(())
    }
}

pub struct MergeStage;

impl Stage for MergeStage {
    fn name(&self) -> &str { "merge" }

    fn run(&self, ctx: &mut PartitionContext) -> anyhow::Result<()> {
        let annotated = ctx.annotated.as_ref().ok_or_else(|| missing(self.name(), "an annotated graph"))?;
        ctx.merged = Some(merge(annotated, ctx.config.merge_options())?);
        Ok(())
    }
}

pub struct PartitionStage;

impl Stage for PartitionStage {
    fn name(&self) -> &str { "partition" }

    fn run(&self, ctx: &mut PartitionContext) -> anyhow::Result<()> {
        let merged = ctx.merged.as_ref().ok_or_else(|| missing(self.name(), "merged regions"))?;
        ctx.module = Some(partition(merged)?);
        Ok(())
    }
}

/// Writes every function's model, calibration data and descriptor.
/// A region that fails to export is recorded in `statuses`; the stage itself
/// still succeeds.
pub struct ExportStage;

impl Stage for ExportStage {
    fn name(&self) -> &str { "export" }

    fn run(&self, ctx: &mut PartitionContext) -> anyhow::Result<()> {
        let module = ctx.module.as_ref().ok_or_else(|| missing(self.name(), "a partitioned module"))?;
        let settings = ctx.config.compile_settings();
        for (name, result) in export_all(module, &settings.output_dir, &settings.export) {
            match result {
                Ok(region) => {
                    ctx.statuses.insert(name.clone(), RegionStatus::Exported { model: region.model_path.clone() });
                    ctx.exported.insert(name, region);
                }
                Err(e) => {
                    ctx.statuses.insert(name, RegionStatus::ExportFailed(e));
                }
            }
        }
        Ok(())
    }
}

/// Hands exported regions to the compiler, if one is configured.
pub struct CompileStage {
    pub compiler: Option<Box<dyn ExternalCompiler>>,
}

impl Stage for CompileStage {
    fn name(&self) -> &str { "compile" }

    fn run(&self, ctx: &mut PartitionContext) -> anyhow::Result<()> {
        if ctx.module.is_none() {
            return Err(missing(self.name(), "a partitioned module"));
        }
        let settings = ctx.config.compile_settings();
        let compiled = compile_regions(&ctx.exported, &settings, self.compiler.as_deref());
        ctx.statuses.extend(compiled);
        Ok(())
    }
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Annotate, merge and partition.
    pub fn partitioning() -> Self {
        let mut pipeline = Self::new();
        pipeline.add_stage(AnnotateStage);
        pipeline.add_stage(MergeStage);
        pipeline.add_stage(PartitionStage);
        pipeline
    }

    pub fn add_stage<S: Stage + 'static>(&mut self, stage: S) {
        self.stages.push(Box::new(stage));
    }

    pub fn execute(&self, ctx: &mut PartitionContext) -> anyhow::Result<()> {
        for stage in &self.stages {
            info!(stage = stage.name(), "running");
            stage.run(ctx)?;
        }
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
