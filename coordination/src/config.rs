//! Explicit, process-wide configuration.
//!
//! Every environment variable the core honours (§6) is read exactly once,
//! here, via [`SwarmConfig::from_env`]. Nothing downstream of `main` calls
//! `std::env::var` directly — this is the REDESIGN FLAG "shell-era global
//! state -> explicit configuration struct" made concrete.

use std::path::PathBuf;
use std::time::Duration;

/// How `swarmctl status`/`logs` render output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Plain,
    Json,
}

impl OutputMode {
    fn from_env_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            OutputMode::Json
        } else {
            OutputMode::Plain
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Root for coordination state (`swarm.db`) and worker scratch directories.
    pub ralph_dir: PathBuf,
    /// Parallelism: number of workers spawned per run.
    pub max_workers: usize,
    /// Delay between spawning successive workers, to avoid thundering-herd
    /// git-worktree creation.
    pub spawn_delay: Duration,
    /// Hard wall-clock timeout bounding a single LLM agent invocation.
    pub task_timeout: Duration,
    pub output_mode: OutputMode,
    /// Override of default-branch discovery.
    pub base_branch: Option<String>,
    pub project_name: Option<String>,
    pub projects_base: Option<PathBuf>,
    /// May contain the literal substring `%RUN_ID%`.
    pub artifacts_dir_template: Option<String>,
    /// Run-wide timeout, measured from the scheduler's own start.
    pub run_timeout: Duration,
    /// Scheduler sweep interval.
    pub poll_interval: Duration,
    /// Minimum cadence at which a worker must call `worker_heartbeat`.
    pub heartbeat_interval: Duration,
    /// Sleep duration after a `claim_task` miss.
    pub claim_poll_interval: Duration,
    /// Age past which a worker's heartbeat is considered stale.
    pub stale_worker_threshold: Duration,
    /// Cap on `stall_count` used by `retry_failed`.
    pub max_retries: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            ralph_dir: PathBuf::from(".ralph"),
            max_workers: 4,
            spawn_delay: Duration::from_millis(500),
            task_timeout: Duration::from_secs(600),
            output_mode: OutputMode::Plain,
            base_branch: None,
            project_name: None,
            projects_base: None,
            artifacts_dir_template: None,
            run_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            claim_poll_interval: Duration::from_secs(2),
            stale_worker_threshold: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl SwarmConfig {
    /// Build configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            ralph_dir: std::env::var("RALPH_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.ralph_dir),
            max_workers: std::env::var("SWARM_MAX_WORKERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.max_workers),
            spawn_delay: std::env::var("SWARM_SPAWN_DELAY")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.spawn_delay),
            task_timeout: std::env::var("SWARM_TASK_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.task_timeout),
            output_mode: std::env::var("SWARM_OUTPUT_MODE")
                .ok()
                .map(|s| OutputMode::from_env_str(&s))
                .unwrap_or(default.output_mode),
            base_branch: std::env::var("SWARM_BASE_BRANCH").ok(),
            project_name: std::env::var("SWARM_PROJECT_NAME").ok(),
            projects_base: std::env::var("SWARM_PROJECTS_BASE").ok().map(PathBuf::from),
            artifacts_dir_template: std::env::var("SWARM_ARTIFACTS_DIR").ok(),
            run_timeout: default.run_timeout,
            poll_interval: default.poll_interval,
            heartbeat_interval: default.heartbeat_interval,
            claim_poll_interval: default.claim_poll_interval,
            stale_worker_threshold: default.stale_worker_threshold,
            max_retries: default.max_retries,
        }
    }

    /// Path to the coordination store's on-disk database file.
    pub fn db_path(&self) -> PathBuf {
        self.ralph_dir.join("swarm.db")
    }

    /// Directory under which a given worker's worktree and logs live:
    /// `<RALPH_DIR>/swarm/runs/<run_id>/worker-<n>/`.
    pub fn worker_dir(&self, run_id: &str, worker_num: u32) -> PathBuf {
        self.ralph_dir
            .join("swarm")
            .join("runs")
            .join(run_id)
            .join(format!("worker-{worker_num}"))
    }

    /// Resolve `SWARM_ARTIFACTS_DIR`, substituting `%RUN_ID%`.
    pub fn artifacts_dir(&self, run_id: &str) -> Option<PathBuf> {
        self.artifacts_dir_template
            .as_ref()
            .map(|t| PathBuf::from(t.replace("%RUN_ID%", run_id)))
    }
}
