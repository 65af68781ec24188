use clap::Parser;
use cvflow_partition::config::Config;
use cvflow_partition::ir::json::load_graph;
use cvflow_partition::logging::init_logging;
use cvflow_partition::pipeline::{CompileStage, ExportStage, PartitionContext, Pipeline};
use cvflow_partition::printer::ModulePrinter;
use cvflow_partition::toolchain::{ExternalCompiler, ModuleManifest};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cvflow-partition", version)]
#[command(about = "Partition a dataflow graph into CV22-offloaded functions", long_about = None)]
struct Cli {
    /// Graph description in JSON
    graph: PathBuf,

    /// Run configuration (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the partitioned module to stdout
    #[arg(long)]
    print: bool,

    /// Export every function and run the configured compiler on it
    #[arg(long)]
    compile: bool,

    /// Overrides `output_folder` from the configuration
    #[arg(long)]
    output_folder: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = cli.output_folder {
        config.output_folder = dir;
    }

    // 1. Load
    let graph = load_graph(&cli.graph)?;
    info!(graph = %graph.name, nodes = graph.graph.node_count(), "loaded {}", cli.graph.display());

    // 2. Annotate, merge, partition (and optionally export/compile)
    let compiler = config.compiler.clone().map(|c| Box::new(c) as Box<dyn ExternalCompiler>);
    if cli.compile && compiler.is_none() {
        warn!("no compiler configured, functions are only exported");
    }
    let mut pipeline = Pipeline::partitioning();
    if cli.compile {
        pipeline.add_stage(ExportStage);
        pipeline.add_stage(CompileStage { compiler });
    }
    let mut ctx = PartitionContext::new(graph, config)?;
    pipeline.execute(&mut ctx)?;

    let module = ctx.module.as_ref().ok_or_else(|| anyhow::anyhow!("Partitioning produced no module"))?;
    if cli.print {
        let printer = ModulePrinter::new()?;
        if let Some(annotated) = &ctx.annotated {
            println!("// annotated");
            print!("{}", printer.print_graph(annotated)?);
        }
        println!("// partitioned");
        print!("{}", printer.print_module(module)?);
    }
    if !cli.compile {
        return Ok(());
    }

    // 3. Report
    for (name, status) in &ctx.statuses {
        println!("{:<16} {:<16} {}", name, status.label(), status);
    }
    let manifest = ModuleManifest::from_statuses(&ctx.statuses);
    std::fs::create_dir_all(&ctx.config.output_folder)?;
    let manifest_path = ctx.config.output_folder.join("manifest.json");
    manifest.save(&manifest_path)?;
    info!(compiled = manifest.subgraphs.len(), total = ctx.statuses.len(), "wrote {}", manifest_path.display());

    if ctx.statuses.values().any(|s| !s.is_success()) {
        return Err(anyhow::anyhow!("Some regions failed, see the table above"));
    }
    Ok(())
}
