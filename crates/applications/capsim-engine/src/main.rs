//! Capsim CLI
//!
//! Runs capacity-planning simulations from a configuration file or on a
//! synthetic workload.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capsim_core::SloCatalog;
use capsim_engine::config::{PlacementAlgo, SimulationConfig};
use capsim_engine::predictor::ViolationPredictor;
use capsim_engine::runner::{SimulationSummary, run_experiment};
use capsim_engine::slo::SloSpecification;
use capsim_engine::synthetic::SyntheticTraceGenerator;
use capsim_engine::trace::TraceSet;

#[derive(Parser)]
#[command(name = "capsim")]
#[command(about = "Simulate tenant placement and rolling upgrades on a database ring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every experiment of a configuration file
    Run {
        /// Simulation configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Write the summary as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override runs per configuration
        #[arg(long)]
        runs: Option<usize>,

        /// Evaluate only this placement heuristic
        #[arg(long)]
        heuristic: Option<String>,
    },

    /// Run on a synthetic workload with the built-in SLO catalog
    Synth {
        /// Tenants to generate
        #[arg(short, long, default_value_t = 400)]
        tenants: usize,

        /// Ring size (multiple of 4)
        #[arg(short, long, default_value_t = 40)]
        nodes: usize,

        /// Simulated hours
        #[arg(long, default_value_t = 72)]
        hours: u64,

        /// Placement heuristic
        #[arg(long, default_value = "WorstFit")]
        heuristic: String,

        /// Runs to average over
        #[arg(long, default_value_t = 1)]
        runs: usize,

        /// Workload seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Write the summary as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the default configuration
    DefaultConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capsim=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            runs,
            heuristic,
        } => {
            let mut sim = SimulationConfig::from_file(&config)
                .with_context(|| format!("Failed to load configuration {}", config.display()))?;
            if let Some(runs) = runs {
                sim.runs_per_configuration = runs;
            }
            if let Some(heuristic) = heuristic {
                let template = sim.placement_algorithms.first().cloned().unwrap_or_default();
                sim.placement_algorithms = vec![PlacementAlgo {
                    heuristic,
                    ..template
                }];
            }
            simulate(&sim, output.as_deref())
        }
        Commands::Synth {
            tenants,
            nodes,
            hours,
            heuristic,
            runs,
            seed,
            output,
        } => {
            let mut sim = SimulationConfig::default();
            sim.synthetic.tenants = tenants;
            sim.synthetic.seed = seed;
            sim.synthetic.arrival_spread_hours = hours;
            sim.cluster.nodes = nodes;
            sim.simulation_duration_hours = hours;
            sim.runs_per_configuration = runs;
            sim.placement_algorithms = vec![PlacementAlgo {
                heuristic,
                ..PlacementAlgo::default()
            }];
            simulate(&sim, output.as_deref())
        }
        Commands::DefaultConfig => {
            println!("{}", SimulationConfig::default().to_json()?);
            Ok(())
        }
    }
}

fn simulate(sim: &SimulationConfig, output: Option<&Path>) -> Result<()> {
    let experiments = sim.experiments().context("Invalid simulation configuration")?;

    let catalog = match &sim.slo_file {
        Some(path) => SloSpecification::from_file(path, &sim.hardware_generation)
            .with_context(|| format!("Failed to load SLO catalog {}", path.display()))?,
        None => SloSpecification::builtin(&sim.hardware_generation),
    };
    info!("SLO catalog: {} entries for {}", catalog.len(), catalog.generation());

    let mut traces = match &sim.trace_file {
        Some(path) => TraceSet::from_file(path, sim.use_only_new_tenants)
            .with_context(|| format!("Failed to load traces {}", path.display()))?,
        None => SyntheticTraceGenerator::new(sim.synthetic.clone(), &catalog)
            .generate()
            .context("Failed to generate synthetic traces")?,
    };
    info!(
        "Loaded {} tenants ({} replicas)",
        traces.num_tenants(),
        traces.num_replicas()
    );

    let predictor = Arc::new(
        ViolationPredictor::train(&mut traces, &catalog, sim.predictor_seed)
            .context("Failed to train violation predictor")?,
    );
    let traces = Arc::new(traces);
    let slos: Arc<dyn SloCatalog> = Arc::new(catalog);

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  Capsim Simulation Engine                                ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");
    println!("Experiments: {}", experiments.len());
    println!("Runs per experiment: {}\n", sim.runs_per_configuration);

    let mut summary = SimulationSummary::default();
    for params in &experiments {
        let result = run_experiment(
            params,
            Arc::clone(&traces),
            Arc::clone(&slos),
            Arc::clone(&predictor),
            sim.runs_per_configuration,
        )
        .with_context(|| format!("Experiment {} failed", params.id))?;

        if let Some(dir) = &sim.output_directory {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = dir.join(format!("experiment_{}.tsv", params.id));
            fs::write(&path, result.to_tsv())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        summary.push(result);
    }

    println!(
        "{:<6} {:<38} {:>8} {:>8} {:>8} {:>10} {:>10}",
        "Id", "Heuristic", "vCore %", "Mem %", "Disk %", "Moves", "Violations"
    );
    println!("{}", "-".repeat(94));
    for experiment in summary.ranked() {
        let stats = &experiment.statistics;
        println!(
            "{:<6} {:<38} {:>8.1} {:>8.1} {:>8.1} {:>10.1} {:>10.1}",
            experiment.id,
            format!("{} / {:?}", experiment.heuristic, experiment.weighting_scheme),
            stats.vcore_util,
            stats.mem_util,
            stats.disk_util,
            experiment.total_moves(),
            stats.mem_violations + stats.disk_violations,
        );
    }

    if let Some(path) = output {
        fs::write(path, summary.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }
    Ok(())
}
