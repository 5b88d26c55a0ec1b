//! The Scheduler (§4.4): a single coordinator-side loop that sweeps for dead
//! workers, enforces the run-wide timeout, and decides when a run is done.
//! It never executes tasks and never calls the LLM.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::SwarmConfig;
use crate::error::CoordResult;
use crate::store::CoordinationStore;
use crate::worker::spawn::is_process_alive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// Zero pending and zero in_progress tasks remained: the run is done.
    Completed,
    /// Zero workers were alive at a sweep: the caller should resume later.
    ResumeRequired,
    /// The run-wide timeout elapsed with work still outstanding.
    TimedOut,
}

/// Run the scheduler loop for `run_id` until a terminal outcome. Sleeps
/// `config.poll_interval` between sweeps.
pub async fn run_scheduler_loop(
    store: &mut CoordinationStore,
    config: &SwarmConfig,
    run_id: &str,
) -> CoordResult<SchedulerOutcome> {
    let scheduler_start = Instant::now();

    loop {
        let reaped = store.cleanup_stale_workers(run_id, config.stale_worker_threshold)?;
        if reaped > 0 {
            warn!(run_id, reaped, "dead-worker sweep reaped stale workers");
        }

        let workers = store.list_workers(run_id)?;
        let alive = workers
            .iter()
            .filter(|w| w.pid.map(is_process_alive).unwrap_or(false))
            .count();

        let tasks = store.list_tasks(run_id)?;
        let pending = tasks
            .iter()
            .filter(|t| matches!(t.status, crate::store::TaskStatus::Pending))
            .count();
        let in_progress = tasks
            .iter()
            .filter(|t| matches!(t.status, crate::store::TaskStatus::InProgress))
            .count();

        info!(
            run_id,
            alive_workers = alive,
            pending,
            in_progress,
            elapsed_secs = scheduler_start.elapsed().as_secs(),
            "scheduler sweep"
        );

        if pending == 0 && in_progress == 0 {
            return Ok(SchedulerOutcome::Completed);
        }

        if alive == 0 {
            warn!(run_id, "no alive workers remain; resume required");
            return Ok(SchedulerOutcome::ResumeRequired);
        }

        if scheduler_start.elapsed() >= config.run_timeout {
            warn!(run_id, "run-wide timeout elapsed with work outstanding");
            return Ok(SchedulerOutcome::TimedOut);
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}

/// `emergency-stop`: mark every worker for every currently-running run as
/// stopped, releasing their locks and requeuing their in-flight tasks. Does
/// not attempt to signal the OS process — the dead-worker sweep's
/// `cleanup_stale_workers` already encodes "stopped worker -> requeue", so
/// this simply forces that state for every run immediately rather than
/// waiting out `stale_worker_threshold`.
pub fn emergency_stop(store: &mut CoordinationStore) -> CoordResult<u32> {
    let mut total = 0;
    for run in store.list_runs()? {
        if !matches!(run.status, crate::store::RunStatus::Running) {
            continue;
        }
        total += store.cleanup_stale_workers(&run.run_id, Duration::ZERO)?;
        store.mark_run_interrupted(&run.run_id)?;
    }
    Ok(total)
}
