//! `swarmctl` — the coordinator binary (§6): analyze a devplan, spawn
//! workers, run the scheduler, and merge the result.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use coordination::devplan::{DevplanAnalyzer, FileScopePredictor, NullPredictor};
use coordination::worker::spawn::{spawn_detached_worker, worker_args};
use coordination::{CoordinationStore, Merger, RunStatus, SchedulerOutcome, SwarmConfig};

mod predictor_select;

#[derive(Parser, Debug)]
#[command(name = "swarmctl")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a devplan, spawn workers, run the scheduler, and merge.
    Start {
        #[arg(long)]
        devplan: PathBuf,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
        /// Skip the merge step that otherwise runs automatically once every
        /// task completes (§6: "analyze, spawn, schedule, merge").
        #[arg(long, default_value_t = false)]
        no_merge: bool,
        /// Rewrite the devplan's checkboxes for completed tasks after the
        /// run finishes. Off by default: the analyzer only ever reads the
        /// devplan, and writing back to it is a convenience for human
        /// readers, not something the coordination store depends on.
        #[arg(long, default_value_t = false)]
        annotate_devplan: bool,
    },
    /// Resume a previously interrupted run.
    Resume { run_id: String },
    /// Show status for one run, or a summary of all runs.
    Status { run_id: Option<String> },
    /// List every run recorded in the coordination store.
    ListRuns,
    /// Print a worker's log file.
    Logs { run_id: String, worker_num: u32 },
    /// Kill all workers for active runs and mark them stopped.
    EmergencyStop,
}

/// Exit codes per §6.
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 1;
    pub const UNRECOVERABLE: i32 = 2;
    pub const INTERRUPTED: i32 = 3;
    pub const RESUME_REQUIRED: i32 = 4;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SwarmConfig::from_env();

    let result = match cli.command {
        Command::Start { devplan, project, workers, no_merge, annotate_devplan } => {
            cmd_start(&config, &devplan, project.as_deref(), workers, !no_merge, annotate_devplan).await
        }
        Command::Resume { run_id } => cmd_resume(&config, &run_id).await,
        Command::Status { run_id } => cmd_status(&config, run_id.as_deref()),
        Command::ListRuns => cmd_list_runs(&config),
        Command::Logs { run_id, worker_num } => cmd_logs(&config, &run_id, worker_num),
        Command::EmergencyStop => cmd_emergency_stop(&config),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "swarmctl command failed");
            eprintln!("error: {e:#}");
            std::process::exit(exit_code::UNRECOVERABLE);
        }
    }
}

fn worker_binary_path() -> Result<PathBuf> {
    let current = std::env::current_exe().context("resolving current executable")?;
    let dir = current.parent().context("executable has no parent directory")?;
    let candidate = dir.join("swarm-worker");
    if candidate.exists() {
        Ok(candidate)
    } else {
        Ok(PathBuf::from("swarm-worker"))
    }
}

fn spawn_workers(config: &SwarmConfig, run_id: &str, worker_count: usize, repo_root: &Path) -> Result<()> {
    let binary = worker_binary_path()?;
    for n in 1..=worker_count as u32 {
        let log_path = config
            .worker_dir(run_id, n)
            .parent()
            .unwrap()
            .join("logs")
            .join(format!("worker-{n}.log"));
        let args = worker_args(run_id, n, &config.ralph_dir);
        let mut full_args = args;
        full_args.push("--repo-root".to_string());
        full_args.push(repo_root.to_string_lossy().into_owned());
        spawn_detached_worker(&binary, &full_args, &log_path, repo_root)
            .with_context(|| format!("spawning worker {n}"))?;
        std::thread::sleep(config.spawn_delay);
    }
    Ok(())
}

fn select_predictor() -> Box<dyn FileScopePredictor> {
    predictor_select::from_env().unwrap_or_else(|| Box::new(NullPredictor))
}

async fn cmd_start(
    config: &SwarmConfig,
    devplan: &Path,
    project: Option<&str>,
    workers: Option<usize>,
    auto_merge: bool,
    annotate_devplan: bool,
) -> Result<i32> {
    let mut config = config.clone();
    if let Some(w) = workers {
        config.max_workers = w;
    }
    if let Some(p) = project {
        config.project_name = Some(p.to_string());
    }

    let devplan_contents = std::fs::read_to_string(devplan)
        .with_context(|| format!("reading devplan at {}", devplan.display()))?;
    let source_hash = coordination::hash::source_hash(&devplan_contents);
    let repo_root = devplan.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

    let mut store = CoordinationStore::open(config.db_path())?;

    let run_id = match store.find_existing_run(&source_hash)? {
        Some(existing) => {
            tracing::info!(run_id = %existing, "reusing existing running run for this devplan");
            existing
        }
        None => store.start_run(
            "devplan",
            &devplan.to_string_lossy(),
            &source_hash,
            "",
            config.max_workers as u32,
        )?,
    };

    let predictor = select_predictor();
    let analyzer = DevplanAnalyzer::new(predictor.into());
    let summary = analyzer
        .analyze(&mut store, &run_id, &devplan_contents, &repo_root)
        .await?;
    tracing::info!(run_id = %run_id, inserted = summary.inserted, skipped = summary.skipped, "devplan analyzed");

    spawn_workers(&config, &run_id, config.max_workers, &repo_root)?;

    let outcome = coordination::run_scheduler_loop(&mut store, &config, &run_id).await?;

    if annotate_devplan && matches!(outcome, SchedulerOutcome::Completed) {
        annotate_devplan_file(&mut store, &run_id, devplan)?;
    }

    finish_run(&config, &mut store, &run_id, outcome, auto_merge)
}

/// Rewrite the devplan's checkboxes for every task this run completed,
/// per the `--annotate-devplan` flag. Best-effort: a task without a
/// `devplan_line` (predicted rather than ingested from the file) or a
/// line that no longer looks like a task line is skipped rather than
/// failing the whole run.
fn annotate_devplan_file(store: &mut CoordinationStore, run_id: &str, devplan: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(devplan)
        .with_context(|| format!("re-reading devplan at {}", devplan.display()))?;

    let mut updated = contents;
    for task in store.list_tasks(run_id)? {
        if !matches!(task.status, coordination::TaskStatus::Completed) {
            continue;
        }
        let Some(line_no) = task.devplan_line else {
            continue;
        };
        if let Some(next) = coordination::devplan::markdown::set_marker(&updated, line_no, "x") {
            updated = next;
        }
    }

    std::fs::write(devplan, updated)
        .with_context(|| format!("writing annotated devplan to {}", devplan.display()))?;
    Ok(())
}

async fn cmd_resume(config: &SwarmConfig, run_id: &str) -> Result<i32> {
    let mut store = CoordinationStore::open(config.db_path())?;
    let run = store
        .get_run(run_id)?
        .with_context(|| format!("no such run: {run_id}"))?;
    if !matches!(run.status, RunStatus::Interrupted) {
        bail!("run {run_id} is not in an interrupted state (status: {:?})", run.status);
    }

    store.resume_run(run_id)?;

    let repo_root = Path::new(&run.source_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    spawn_workers(config, run_id, run.worker_count as usize, &repo_root)?;

    let outcome = coordination::run_scheduler_loop(&mut store, config, run_id).await?;

    finish_run(config, &mut store, run_id, outcome, true)
}

fn finish_run(
    config: &SwarmConfig,
    store: &mut CoordinationStore,
    run_id: &str,
    outcome: SchedulerOutcome,
    auto_merge: bool,
) -> Result<i32> {
    match outcome {
        SchedulerOutcome::Completed => {
            // The scheduler loop's own "zero pending, zero in_progress" read
            // is the authority here — `complete_task` already marks the run
            // completed on the ordinary path, but `resume_run` can promote
            // an in-progress task straight to completed without going
            // through it, leaving `run.status` stuck on `running`.
            store.finalize_run_if_complete(run_id)?;
            if auto_merge {
                let merger = Merger::new(config.clone());
                let report = merger.run(store, run_id)?;
                tracing::info!(
                    run_id,
                    destination = %report.destination.display(),
                    missing = report.missing_files.len(),
                    "merge complete"
                );
            }
            Ok(exit_code::SUCCESS)
        }
        SchedulerOutcome::ResumeRequired => {
            store.mark_run_interrupted(run_id)?;
            Ok(exit_code::RESUME_REQUIRED)
        }
        SchedulerOutcome::TimedOut => {
            store.mark_run_interrupted(run_id)?;
            Ok(exit_code::INTERRUPTED)
        }
    }
}

fn cmd_status(config: &SwarmConfig, run_id: Option<&str>) -> Result<i32> {
    let store = CoordinationStore::open(config.db_path())?;
    let run_ids: Vec<String> = match run_id {
        Some(id) => vec![id.to_string()],
        None => store.list_runs()?.into_iter().map(|r| r.run_id).collect(),
    };

    for id in run_ids {
        let Some(run) = store.get_run(&id)? else {
            eprintln!("no such run: {id}");
            continue;
        };
        let (prompt_tokens, completion_tokens, cost) = store.cost_rollup(&id)?;
        println!(
            "run {} [{:?}] tasks: {}/{} completed, {} failed, workers: {} | tokens: {}+{} cost: {:.4}",
            run.run_id,
            run.status,
            run.completed_tasks,
            run.total_tasks,
            run.failed_tasks,
            run.worker_count,
            prompt_tokens,
            completion_tokens,
            cost
        );
    }
    Ok(exit_code::SUCCESS)
}

fn cmd_list_runs(config: &SwarmConfig) -> Result<i32> {
    let store = CoordinationStore::open(config.db_path())?;
    for run in store.list_runs()? {
        println!(
            "{} [{:?}] started {} source {}",
            run.run_id, run.status, run.started_at, run.source_path
        );
    }
    Ok(exit_code::SUCCESS)
}

fn cmd_logs(config: &SwarmConfig, run_id: &str, worker_num: u32) -> Result<i32> {
    let log_path = config
        .worker_dir(run_id, worker_num)
        .parent()
        .unwrap()
        .join("logs")
        .join(format!("worker-{worker_num}.log"));
    let contents = std::fs::read_to_string(&log_path)
        .with_context(|| format!("reading worker log at {}", log_path.display()))?;
    print!("{contents}");
    Ok(exit_code::SUCCESS)
}

fn cmd_emergency_stop(config: &SwarmConfig) -> Result<i32> {
    let mut store = CoordinationStore::open(config.db_path())?;
    let reaped = coordination::emergency_stop(&mut store)?;
    tracing::info!(reaped, "emergency stop complete");
    Ok(exit_code::SUCCESS)
}
