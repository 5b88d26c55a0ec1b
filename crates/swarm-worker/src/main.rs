//! Entry point for a single swarm worker: spawned detached, once per
//! parallelism slot, by `swarmctl start`/`swarmctl resume`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use coordination::worker::agent::ProcessAgentRunner;
use coordination::worker::run_worker_loop;
use coordination::{CoordinationStore, SwarmConfig};

#[derive(Parser, Debug)]
#[command(name = "swarm-worker")]
struct Args {
    /// Run this worker belongs to.
    #[arg(long)]
    run_id: String,

    /// This worker's 1-based slot number within the run.
    #[arg(long)]
    worker_num: u32,

    /// Root for coordination state; overrides `RALPH_DIR`.
    #[arg(long)]
    ralph_dir: Option<PathBuf>,

    /// Root of the source git repository this run operates over.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// Path to the agent binary invoked for each task.
    #[arg(long, default_value = "llm-agent")]
    agent_binary: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = SwarmConfig::from_env();
    if let Some(dir) = args.ralph_dir {
        config.ralph_dir = dir;
    }

    let store = CoordinationStore::open(config.db_path())
        .with_context(|| format!("opening coordination store at {:?}", config.db_path()))?;
    let store = Arc::new(Mutex::new(store));

    let runner = ProcessAgentRunner::new(args.agent_binary);

    let outcome = run_worker_loop(
        store,
        &config,
        &args.run_id,
        args.worker_num,
        &runner,
        &args.repo_root,
    )
    .await
    .with_context(|| format!("worker {} for run {} failed", args.worker_num, args.run_id))?;

    tracing::info!(run_id = %args.run_id, worker_num = args.worker_num, ?outcome, "worker exiting");
    Ok(())
}
