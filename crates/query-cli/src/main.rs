use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use query_distributed::{
    Coordinator, OperatorRegistry, PlanNode, StageGraph, Worker, WorkerInfo,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "qe-cluster")]
#[command(author, version, about = "Query Engine - distributed stage-job runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a worker node
    Worker {
        /// Worker name; looked up in the config file when host/port are omitted
        #[arg(short, long)]
        name: String,

        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Control-plane port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Start a coordinator that registers the configured workers and
    /// receives heartbeats
    Coordinator {
        /// Host to bind the heartbeat listener to
        #[arg(short = 'H', long, default_value = "0.0.0.0")]
        host: String,

        /// Heartbeat port
        #[arg(short, long, default_value = "7070")]
        port: u16,
    },

    /// Plan, dispatch and collect a JSON logical plan on the configured workers
    Run {
        /// Plan file
        #[arg(short, long)]
        plan: PathBuf,

        /// Instances per parallel stage
        #[arg(short = 'n', long)]
        parallelism: Option<usize>,
    },

    /// Print the stage graph of a JSON logical plan
    Explain {
        /// Plan file
        #[arg(short, long)]
        plan: PathBuf,

        /// Instances per parallel stage
        #[arg(short = 'n', long)]
        parallelism: Option<usize>,

        /// Print the graph as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose)?;

    // Load configuration
    let config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Worker { name, host, port } => run_worker(&config, name, host, port).await,
        Commands::Coordinator { host, port } => run_coordinator(&config, &host, port).await,
        Commands::Run { plan, parallelism } => run_query(&config, &plan, parallelism).await,
        Commands::Explain {
            plan,
            parallelism,
            json,
        } => explain(&config, &plan, parallelism, json),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        "query_cli=debug,query_core=debug,query_distributed=debug"
    } else {
        "query_cli=info,query_distributed=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Fires the returned receiver on Ctrl-C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        tx.send_replace(true);
    });
    rx
}

async fn run_worker(config: &Config, name: String, host: Option<String>, port: Option<u16>) -> Result<()> {
    let info = match (config.worker(&name), host, port) {
        (_, Some(host), Some(port)) => WorkerInfo::new(name, host, port, 0),
        (Some(entry), host, port) => WorkerInfo::new(
            name,
            host.unwrap_or_else(|| entry.host.clone()),
            port.unwrap_or(entry.control_port),
            entry.data_port,
        ),
        (None, _, _) => bail!("worker {} is not in the config; pass --host and --port", name),
    };

    let listener = TcpListener::bind((info.host.as_str(), info.control_port))
        .await
        .with_context(|| format!("binding {}:{}", info.host, info.control_port))?;

    println!(
        "{} {} listening on {}",
        "Worker".bright_green().bold(),
        info.name.bright_white(),
        listener.local_addr()?.to_string().bright_cyan()
    );

    let worker = Arc::new(
        Worker::new(info, OperatorRegistry::with_builtins()).with_network(config.network.clone()),
    );
    worker.serve(listener, shutdown_on_ctrl_c()).await?;
    Ok(())
}

async fn run_coordinator(config: &Config, host: &str, port: u16) -> Result<()> {
    let coordinator = Arc::new(build_coordinator(config)?);
    if coordinator.worker_count() == 0 {
        println!("{}", "No workers configured".bright_yellow());
    }

    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding {}:{}", host, port))?;
    println!(
        "{} receiving heartbeats on {}",
        "Coordinator".bright_green().bold(),
        listener.local_addr()?.to_string().bright_cyan()
    );
    for worker in coordinator.list_workers() {
        println!(
            "  {} {}:{}",
            worker.name.bright_white(),
            worker.host,
            worker.control_port
        );
    }

    coordinator.serve_heartbeats(listener, shutdown_on_ctrl_c()).await?;
    Ok(())
}

fn load_plan(plan_path: &Path) -> Result<PlanNode> {
    let contents = std::fs::read_to_string(plan_path)
        .with_context(|| format!("reading plan {}", plan_path.display()))?;
    let plan = serde_json::from_str(&contents)
        .with_context(|| format!("parsing plan {}", plan_path.display()))?;
    Ok(plan)
}

fn build_coordinator(config: &Config) -> Result<Coordinator> {
    let coordinator =
        Coordinator::new(config.cluster.clone()).with_network(config.network.clone());
    for worker in &config.workers {
        coordinator.register_worker(worker.clone())?;
    }
    Ok(coordinator)
}

async fn run_query(config: &Config, plan_path: &Path, parallelism: Option<usize>) -> Result<()> {
    let plan = load_plan(plan_path)?;
    let coordinator = Arc::new(build_coordinator(config)?);
    let runtime = config.query_runtime();

    // failure detection needs the heartbeat listener up before dispatch
    let (stop, stop_rx) = watch::channel(false);
    if let Some(addr) = &runtime.coordinator {
        let listener = TcpListener::bind(addr.as_str())
            .await
            .with_context(|| format!("binding heartbeat listener {}", addr))?;
        tokio::spawn(Arc::clone(&coordinator).serve_heartbeats(listener, stop_rx));
    }

    let result = coordinator.execute(&plan, parallelism, &runtime).await;
    stop.send_replace(true);
    let rows = result?;

    for row in &rows {
        let values: Vec<String> = row.vals.iter().map(|v| v.to_string()).collect();
        println!("{}", values.join(" | "));
    }
    println!(
        "{}",
        format!("{} rows ({})", rows.len(), runtime.query_id).bright_yellow()
    );
    Ok(())
}

fn explain(config: &Config, plan_path: &Path, parallelism: Option<usize>, json: bool) -> Result<()> {
    let plan = load_plan(plan_path)?;
    let coordinator = build_coordinator(config)?;
    let graph = coordinator.plan(&plan, parallelism)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&graph)?);
    } else {
        print_graph(&graph);
    }
    Ok(())
}

fn print_graph(graph: &StageGraph) {
    println!("{}", format!("Stage graph ({} jobs)", graph.len()).bright_yellow());
    for job in graph.jobs() {
        let marker = if job.location.name == graph.sink().location.name {
            "sink".bright_magenta()
        } else {
            "    ".normal()
        };
        let inputs: Vec<String> = job
            .inputs
            .iter()
            .map(|l| format!("{}#{}", l.name, l.channel_index))
            .collect();
        println!(
            "{} {:<14} {:<16} <- [{}] -> {} outputs",
            marker,
            job.tag().to_string().bright_cyan(),
            job.location.name.bright_white(),
            inputs.join(", "),
            job.outputs.len()
        );
    }
}
