//! stest - replication cluster scenario harness
//!
//! Validates topologies and the built-in scenario suite, prints fault plans,
//! and runs the whole suite against the in-memory simulated cluster.

#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use stest_common::catalog::{CatalogEntry, stop_start};
use stest_common::{
    HarnessConfig, LogConfig, NodeName, NodeProcesses, NodeRole, ScenarioExecutor, SimCluster,
    SuiteRunner, Topology, default_suite, init_logging, nonempty_subsets,
};
use stest_common::{ExplorationMode, FaultPlanner};
use tracing::{info, warn};

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "stest")]
#[command(author, version, about = "Replication cluster scenario harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Harness configuration file (TOML)
    #[arg(short, long, global = true, env = "STEST_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a topology file and the built-in suite against it
    Validate {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: PathBuf,

        /// Volume the suite runs on (defaults to the first declared volume)
        #[arg(long)]
        volume: Option<String>,
    },

    /// Print the stop/start fault plans for a set of nodes
    Plan {
        /// Nodes to fault, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Sample this many plans instead of enumerating all of them
        #[arg(long)]
        sample: Option<usize>,

        /// Sampling seed
        #[arg(long, requires = "sample")]
        seed: Option<u64>,

        /// Emit JSON instead of one plan per line
        #[arg(long)]
        json: bool,
    },

    /// Run the built-in suite and fault plans against a simulated cluster
    Simulate {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: PathBuf,

        /// Volume the suite runs on (defaults to the first declared volume)
        #[arg(long)]
        volume: Option<String>,

        /// Nodes to fault, comma separated (defaults to the first storage,
        /// proxy and archive)
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Sample this many fault plans
        #[arg(long)]
        sample: Option<usize>,

        /// Sampling seed
        #[arg(long, requires = "sample")]
        seed: Option<u64>,

        /// Run the whole suite this many times
        #[arg(long)]
        repeat: Option<u32>,

        /// Stop at the first failed scenario
        #[arg(long)]
        fail_fast: bool,

        /// Run this many randomly drawn scenarios instead of the fixed suite
        #[arg(long)]
        random_actions: Option<u32>,

        /// Seed for the random draw
        #[arg(long, requires = "random_actions")]
        random_seed: Option<u64>,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let config = HarnessConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { topology, volume } => validate(&topology, volume.as_deref(), &config),
        Commands::Plan {
            nodes,
            sample,
            seed,
            json,
        } => {
            let mut config = config;
            override_exploration(&mut config, sample, seed);
            print_plans(&nodes, &config, json)
        }
        Commands::Simulate {
            topology,
            volume,
            nodes,
            sample,
            seed,
            repeat,
            fail_fast,
            random_actions,
            random_seed,
            output,
        } => {
            let mut config = config;
            override_exploration(&mut config, sample, seed);
            if let Some(repeat) = repeat {
                config.suite.repeat = repeat;
            }
            config.suite.fail_fast |= fail_fast;
            if random_actions.is_some() {
                config.suite.random_actions = random_actions;
            }
            if random_seed.is_some() {
                config.suite.random_seed = random_seed;
            }
            simulate(&topology, volume.as_deref(), &nodes, config, output.as_deref()).await
        }
    }
}

/// CLI flags win over file and environment.
fn override_exploration(config: &mut HarnessConfig, sample: Option<usize>, seed: Option<u64>) {
    if sample.is_some() {
        config.exploration.sample = sample;
    }
    if seed.is_some() {
        config.exploration.seed = seed;
    }
}

fn pick_volume(topology: &Topology, volume: Option<&str>) -> Result<String> {
    match volume {
        Some(v) => {
            topology.device_for(v)?;
            Ok(v.to_string())
        }
        None => topology
            .volumes()
            .next()
            .map(str::to_string)
            .context("topology declares no volume"),
    }
}

fn validate(path: &Path, volume: Option<&str>, config: &HarnessConfig) -> Result<()> {
    let topology = Topology::load(path)?;
    let volume = pick_volume(&topology, volume)?;
    let suite = default_suite(&topology, &volume)?;

    // Validation issues no cluster operations; the simulator only satisfies
    // the executor's type.
    let sim = SimCluster::new(topology.clone());
    let executor = ScenarioExecutor::new(&sim, &topology, config);
    let mut invalid = 0;
    for entry in &suite {
        let (CatalogEntry::Scenario(spec) | CatalogEntry::Negative(spec)) = entry;
        match executor.validate(spec) {
            Ok(()) => println!("ok      {}", spec.name),
            Err(e) => {
                invalid += 1;
                println!("invalid {}: {}", spec.name, e);
            }
        }
    }

    for role in [NodeRole::Storage, NodeRole::Proxy, NodeRole::Archive] {
        info!(role = %role, count = topology.nodes(role).len(), "nodes");
    }
    if invalid > 0 {
        bail!("{invalid} of {} scenarios are invalid", suite.len());
    }
    println!("{} scenarios valid on volume {volume}", suite.len());
    Ok(())
}

fn planner_for(nodes: &[NodeName], config: &HarnessConfig) -> FaultPlanner {
    FaultPlanner::new(nonempty_subsets(nodes), config.exploration.mode())
        .with_fail_fast(config.suite.fail_fast)
}

fn print_plans(nodes: &[String], config: &HarnessConfig, json: bool) -> Result<()> {
    let nodes: Vec<NodeName> = nodes.iter().map(|n| NodeName::from(n.as_str())).collect();
    let planner = planner_for(&nodes, config);
    let plans: Vec<_> = planner.plans().collect();

    if json {
        let out = serde_json::json!({
            "exploration": planner.mode(),
            "total": planner.total_count(),
            "planned": planner.planned_count(),
            "plans": plans,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        if let ExplorationMode::Sampled { size, seed } = planner.mode() {
            println!("# sampled {size} of {} (seed {seed})", planner.total_count());
        }
        for plan in &plans {
            println!("{plan}");
        }
        println!("# {} plans", plans.len());
    }
    Ok(())
}

/// The simulator writes to the real device file; create it zeroed when the
/// topology points somewhere that does not exist yet.
fn ensure_device(topology: &Topology, volume: &str) -> Result<()> {
    let device = topology.device_for(volume)?;
    if device.path.exists() {
        return Ok(());
    }
    let len = device
        .size_mb
        .max(1)
        .checked_mul(MIB)
        .with_context(|| format!("device size {} MiB is too large", device.size_mb))?;
    if let Some(parent) = device.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&device.path)
        .with_context(|| format!("creating device {}", device.path.display()))?;
    file.set_len(len)?;
    info!(path = %device.path.display(), size_mb = device.size_mb, "created device file");
    Ok(())
}

/// The built-in catalog followed by the stop/start fault plans.
fn fixed_suite(
    topology: &Topology,
    volume: &str,
    nodes: &[String],
    config: HarnessConfig,
) -> Result<SuiteRunner> {
    let storage = topology.nodes(NodeRole::Storage)[0].name.to_string();
    let archive = topology.primary_archive().name.to_string();
    let planner = planner_for(&fault_nodes(topology, nodes)?, &config);
    info!(
        volume = %volume,
        plans = planner.planned_count(),
        total = planner.total_count(),
        "simulating suite"
    );

    let suite = default_suite(topology, volume)?;
    let template_volume = volume.to_string();
    Ok(SuiteRunner::new(topology.clone(), config)
        .catalog(suite)
        .fault_plans(planner, move |plan| {
            stop_start(plan, &storage, &archive, &template_volume)
        }))
}

fn fault_nodes(topology: &Topology, nodes: &[String]) -> Result<Vec<NodeName>> {
    if nodes.is_empty() {
        return Ok(vec![
            topology.nodes(NodeRole::Storage)[0].name.clone(),
            topology.nodes(NodeRole::Proxy)[0].name.clone(),
            topology.primary_archive().name.clone(),
        ]);
    }
    let resolved = topology.resolve(nodes)?;
    Ok(resolved.into_iter().map(|n| n.name.clone()).collect())
}

async fn simulate(
    path: &Path,
    volume: Option<&str>,
    nodes: &[String],
    config: HarnessConfig,
    output: Option<&Path>,
) -> Result<()> {
    let topology = Topology::load(path)?;
    let volume = pick_volume(&topology, volume)?;
    ensure_device(&topology, &volume)?;

    let runner = match config.suite.random_actions {
        Some(count) => {
            let seed = config.suite.random_seed();
            info!(volume = %volume, count, seed, "simulating random actions");
            SuiteRunner::new(topology.clone(), config).random_actions(&volume, count, seed)?
        }
        None => fixed_suite(&topology, &volume, nodes, config)?,
    };

    let sim = SimCluster::new(topology);
    let mut processes = NodeProcesses::new();
    let report = runner.run(&sim, &sim, &mut processes).await;

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }

    if !report.success() {
        warn!(
            failed = report.failed,
            total = report.total,
            aborted = report.aborted,
            "suite failed"
        );
    }
    report.into_result()?;
    Ok(())
}
