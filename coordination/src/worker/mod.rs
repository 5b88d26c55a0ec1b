//! Worker runtime (§4.3): one OS process per worker, running inside its own
//! git worktree, driving the claim -> lock -> execute -> finalise loop until
//! no pending task remains.

pub mod agent;
pub mod git;
pub mod spawn;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::SwarmConfig;
use crate::error::CoordResult;
use crate::store::{CoordinationStore, WorkerStatus};
use crate::worker::agent::{build_prompt, AgentRunner};
use crate::worker::git::{branch_name, WorktreeManager};

/// Paths a worker/agent must never touch, regardless of task scope (§4.3).
pub const DENY_LIST: &[&str] = &[".ralph", ".git/hooks", "swarm.db"];

fn deny_paths(ralph_dir: &Path) -> Vec<PathBuf> {
    vec![
        ralph_dir.to_path_buf(),
        PathBuf::from(".git/hooks"),
        ralph_dir.join("swarm.db"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLoopOutcome {
    /// No pending task remained; the worker exited cleanly.
    Drained,
    /// The run-wide or worker-specific condition forced an early stop.
    Stopped,
}

/// Drive one worker through repeated claim/execute/finalise cycles against
/// `store` until no pending task remains for `run_id`. `store` is wrapped in
/// a `Mutex` so the heartbeat task and the main loop can share one
/// connection without racing on `&mut self` methods.
pub async fn run_worker_loop<R: AgentRunner>(
    store: Arc<Mutex<CoordinationStore>>,
    config: &SwarmConfig,
    run_id: &str,
    worker_num: u32,
    agent_runner: &R,
    repo_root: &Path,
) -> CoordResult<WorkerLoopOutcome> {
    let branch = branch_name(run_id, worker_num);
    let worktree_dir = config.worker_dir(run_id, worker_num);
    let worktree_mgr = WorktreeManager::new(repo_root);
    let base_branch = worktree_mgr.default_branch(config.base_branch.as_deref());
    worktree_mgr.create_worktree(&worktree_dir, &branch, &base_branch)?;

    let pid = std::process::id();
    let worker_id = {
        let mut guard = store.lock().await;
        guard.register_worker(
            run_id,
            worker_num,
            pid,
            &branch,
            &worktree_dir.to_string_lossy(),
        )?
    };
    info!(run_id, worker_id = %worker_id, worker_num, "worker registered");

    let heartbeat_handle = spawn_heartbeat_task(
        store.clone(),
        worker_id.clone(),
        config.heartbeat_interval,
    );

    let deny_list = deny_paths(&config.ralph_dir);
    let outcome = loop {
        let claimed = {
            let mut guard = store.lock().await;
            guard.claim_task(&worker_id)?
        };
        let Some(claimed) = claimed else {
            break WorkerLoopOutcome::Drained;
        };

        info!(run_id, worker_id = %worker_id, task_id = claimed.task_id, "task claimed");

        // Idempotency gate (§4.3 step b): a task with this exact text may
        // already have completed under a different id (e.g. a duplicate
        // devplan line, or a prior run racing this one). If so, accept it
        // without re-running the agent — a commit-scan under *this* task's
        // id would never find that other id's commit.
        let already_completed = {
            let guard = store.lock().await;
            guard.is_task_completed(&crate::hash::task_hash(&claimed.task_text))?
        };
        if already_completed {
            info!(run_id, task_id = claimed.task_id, "task text already completed elsewhere, skipping agent run");
            let mut guard = store.lock().await;
            guard.complete_task(&worker_id, claimed.task_id, &[])?;
            continue;
        }

        // Idempotency gate (§8 item 5): if a prior crashed attempt already
        // committed this task's work, accept it without re-running the
        // agent.
        if worktree_mgr.task_already_committed(&branch, claimed.task_id)? {
            info!(run_id, task_id = claimed.task_id, "task already committed, skipping agent run");
            let actual = worktree_mgr
                .changed_files(&branch, &base_branch)
                .unwrap_or_default();
            let mut guard = store.lock().await;
            guard.complete_task(&worker_id, claimed.task_id, &actual)?;
            continue;
        }

        let lock_result = {
            let mut guard = store.lock().await;
            guard.acquire_locks(run_id, &worker_id, claimed.task_id, &claimed.estimated_files)?
        };

        if lock_result.got_none() && !claimed.estimated_files.is_empty() {
            // Couldn't acquire any of the predicted scope: requeue the task
            // for another worker and back off briefly (§4.1 conflict path).
            // This is contention, not failure, so the task goes straight
            // back to pending with stall_count+=1 rather than through
            // fail_task/retry_failed.
            warn!(
                run_id,
                worker_id = %worker_id,
                task_id = claimed.task_id,
                conflicts = lock_result.conflicts.len(),
                "lock acquisition failed entirely, requeuing task"
            );
            let mut guard = store.lock().await;
            guard.requeue_task(&worker_id, claimed.task_id)?;
            drop(guard);
            tokio::time::sleep(config.claim_poll_interval).await;
            continue;
        }

        let prompt = build_prompt(&worker_id, claimed.task_id, &claimed.task_text, &deny_list);
        let run_result = agent_runner
            .run(&prompt, &worktree_dir, config.task_timeout)
            .await;

        // Locks are released on every exit path from this point on.
        let finalise_result = match run_result {
            Ok(outcome) if outcome.signalled_complete() => {
                let actual = worktree_mgr
                    .changed_files(&branch, &base_branch)
                    .unwrap_or_default();
                let mut guard = store.lock().await;
                guard.complete_task(&worker_id, claimed.task_id, &actual)?;
                if outcome.prompt_tokens > 0 || outcome.completion_tokens > 0 || outcome.cost > 0.0 {
                    guard.record_task_cost(
                        run_id,
                        claimed.task_id,
                        outcome.prompt_tokens,
                        outcome.completion_tokens,
                        outcome.cost,
                    )?;
                }
                Ok(())
            }
            Ok(outcome) => {
                warn!(
                    run_id,
                    task_id = claimed.task_id,
                    "agent exited without completion sentinel"
                );
                let mut guard = store.lock().await;
                guard.fail_task(
                    &worker_id,
                    claimed.task_id,
                    &format!(
                        "agent did not signal completion; stderr tail: {}",
                        outcome.stderr_tail
                    ),
                )?;
                Ok(())
            }
            Err(e) => {
                warn!(run_id, task_id = claimed.task_id, error = %e, "agent invocation failed");
                let mut guard = store.lock().await;
                guard.fail_task(&worker_id, claimed.task_id, &e.to_string())?;
                Ok(())
            }
        };

        {
            let mut guard = store.lock().await;
            guard.release_locks(&worker_id)?;
        }

        finalise_result?;
    };

    heartbeat_handle.abort();
    {
        let mut guard = store.lock().await;
        guard.set_worker_status(&worker_id, WorkerStatus::Stopped)?;
    }
    info!(run_id, worker_id = %worker_id, ?outcome, "worker loop finished");

    Ok(outcome)
}

fn spawn_heartbeat_task(
    store: Arc<Mutex<CoordinationStore>>,
    worker_id: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let mut guard = store.lock().await;
            if let Err(e) = guard.worker_heartbeat(&worker_id) {
                warn!(worker_id = %worker_id, error = %e, "heartbeat write failed");
            }
        }
    })
}
