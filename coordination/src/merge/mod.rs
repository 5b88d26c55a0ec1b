//! The Merger / Artifact Extractor (§4.5): after the scheduler exits,
//! bring every worker's committed work into one destination project
//! directory and write a human-readable summary.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::warn;

use crate::config::SwarmConfig;
use crate::error::{CoordError, CoordResult};
use crate::store::{CoordinationStore, Run, Task, Worker};
use crate::worker::git::WorktreeManager;

/// Internal-tooling path prefixes the file-copy merge must never write into
/// (§4.5, §6's "internal-tooling deny-list").
const DENY_PREFIXES: &[&str] = &["coordination/", "crates/", ".ralph/", ".git/"];

pub struct MergeReport {
    pub destination: PathBuf,
    pub worker_reports: Vec<WorkerMergeReport>,
    pub missing_files: Vec<String>,
}

pub struct WorkerMergeReport {
    pub worker_id: String,
    pub branch: String,
    pub changed_files: Vec<String>,
    pub merged_cleanly: bool,
}

pub struct Merger {
    config: SwarmConfig,
}

impl Merger {
    pub fn new(config: SwarmConfig) -> Self {
        Self { config }
    }

    /// Resolve the destination project directory (§9 Open Question,
    /// resolved in DESIGN.md): the devplan's `source_path` parent if that's
    /// inside a git repo, else `SWARM_PROJECT_NAME` under
    /// `SWARM_PROJECTS_BASE`, else the first worker's worktree.
    fn resolve_destination(&self, run: &Run, workers: &[Worker]) -> CoordResult<PathBuf> {
        let source_parent = Path::new(&run.source_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = source_parent {
            if parent.join(".git").exists() {
                return Ok(parent);
            }
        }
        if let (Some(name), Some(base)) = (&self.config.project_name, &self.config.projects_base) {
            return Ok(base.join(name));
        }
        workers
            .first()
            .map(|w| PathBuf::from(&w.work_dir))
            .ok_or_else(|| CoordError::NotFound("no worker worktrees to merge from".into()))
    }

    fn run_git(repo: &Path, args: &[&str]) -> CoordResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .map_err(|e| CoordError::git("execute", e.to_string()))?;
        if !output.status.success() {
            return Err(CoordError::git(
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn ensure_git_repo(&self, destination: &Path) -> CoordResult<()> {
        std::fs::create_dir_all(destination)?;
        if !destination.join(".git").exists() {
            Self::run_git(destination, &["init"])?;
            Self::run_git(destination, &["config", "user.email", "swarm@localhost"])?;
            Self::run_git(destination, &["config", "user.name", "swarm-coordinator"])?;
        }
        Ok(())
    }

    fn is_denied(path: &str) -> bool {
        DENY_PREFIXES.iter().any(|p| path.starts_with(p))
    }

    /// For one worker's branch: compute its merge-base against `base_branch`
    /// (in the worker's own repo, since the worktree shares history with the
    /// source repo), attempt a clean merge in `destination`, and fall back to
    /// file-copy on conflict.
    fn merge_worker(
        &self,
        destination: &Path,
        worker: &Worker,
        base_branch: &str,
    ) -> CoordResult<WorkerMergeReport> {
        let worktree = PathBuf::from(&worker.work_dir);
        let wt_mgr = WorktreeManager::new(&worktree);
        let changed_files = wt_mgr
            .changed_files(&worker.branch_name, base_branch)
            .unwrap_or_default();

        let remote_name = format!("swarm-{}", worker.worker_num);
        let _ = Self::run_git(
            destination,
            &["remote", "add", &remote_name, &worktree.to_string_lossy()],
        );
        let _ = Self::run_git(destination, &["fetch", &remote_name, &worker.branch_name]);

        let merge_attempt = Self::run_git(
            destination,
            &[
                "merge",
                "--no-edit",
                &format!("{remote_name}/{}", worker.branch_name),
            ],
        );

        let merged_cleanly = match merge_attempt {
            Ok(_) => true,
            Err(e) => {
                warn!(worker_id = %worker.id, error = %e, "merge conflict, falling back to file copy");
                let _ = Self::run_git(destination, &["merge", "--abort"]);
                self.file_copy_merge(&worktree, destination, &changed_files)?;
                false
            }
        };

        let _ = Self::run_git(destination, &["remote", "remove", &remote_name]);

        Ok(WorkerMergeReport {
            worker_id: worker.id.clone(),
            branch: worker.branch_name.clone(),
            changed_files,
            merged_cleanly,
        })
    }

    fn file_copy_merge(
        &self,
        worktree: &Path,
        destination: &Path,
        changed_files: &[String],
    ) -> CoordResult<()> {
        for rel in changed_files {
            if Self::is_denied(rel) {
                continue;
            }
            let src = worktree.join(rel);
            let dst = destination.join(rel);
            if !src.exists() {
                continue;
            }
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst)?;
        }
        Ok(())
    }

    /// Verification pass (§4.5 step 5): every completed task's
    /// `actual_files` must exist under `destination`. Missing files are
    /// reported, never fatal.
    fn verify_actual_files(destination: &Path, tasks: &[Task]) -> Vec<String> {
        let mut missing = Vec::new();
        for task in tasks {
            if !matches!(task.status, crate::store::TaskStatus::Completed) {
                continue;
            }
            for file in &task.actual_files {
                if !destination.join(file).exists() {
                    missing.push(format!("task {}: {}", task.id, file));
                }
            }
        }
        missing
    }

    fn write_summary(
        &self,
        destination: &Path,
        run: &Run,
        worker_reports: &[WorkerMergeReport],
        missing_files: &[String],
    ) -> CoordResult<()> {
        let mut summary = String::new();
        summary.push_str("# Swarm Run Summary\n\n");
        summary.push_str(&format!("- Run ID: {}\n", run.run_id));
        summary.push_str(&format!("- Source: {}\n", run.source_path));
        summary.push_str(&format!("- Workers: {}\n", run.worker_count));
        summary.push_str(&format!(
            "- Tasks: {} total, {} completed, {} failed\n\n",
            run.total_tasks, run.completed_tasks, run.failed_tasks
        ));

        summary.push_str("## Worker Merges\n\n");
        for report in worker_reports {
            summary.push_str(&format!(
                "### {} ({})\n\n- merged cleanly: {}\n- changed files:\n",
                report.worker_id, report.branch, report.merged_cleanly
            ));
            for file in &report.changed_files {
                summary.push_str(&format!("  - {file}\n"));
            }
            summary.push('\n');
        }

        if !missing_files.is_empty() {
            summary.push_str("## Verification Warnings\n\n");
            for m in missing_files {
                summary.push_str(&format!("- missing: {m}\n"));
            }
            summary.push('\n');
        }

        std::fs::write(destination.join("SWARM_SUMMARY.md"), summary)?;
        Ok(())
    }

    /// Run the full merge algorithm (§4.5).
    pub fn run(&self, store: &CoordinationStore, run_id: &str) -> CoordResult<MergeReport> {
        let run = store
            .get_run(run_id)?
            .ok_or_else(|| CoordError::NotFound(format!("run {run_id}")))?;
        let workers = store.list_workers(run_id)?;
        let tasks = store.list_tasks(run_id)?;

        let destination = self.resolve_destination(&run, &workers)?;
        self.ensure_git_repo(&destination)?;

        let base_branch = if workers.is_empty() {
            "main".to_string()
        } else {
            let wt_mgr = WorktreeManager::new(PathBuf::from(&workers[0].work_dir));
            wt_mgr.default_branch(self.config.base_branch.as_deref())
        };
        let _ = Self::run_git(&destination, &["checkout", &base_branch]);

        let mut worker_reports = Vec::new();
        for worker in &workers {
            match self.merge_worker(&destination, worker, &base_branch) {
                Ok(report) => worker_reports.push(report),
                Err(e) => warn!(worker_id = %worker.id, error = %e, "failed to merge worker branch"),
            }
        }

        let has_changes = !Self::run_git(&destination, &["status", "--porcelain"])?.is_empty();
        if has_changes {
            Self::run_git(&destination, &["add", "-A"])?;
            Self::run_git(
                &destination,
                &["commit", "-m", &format!("swarm: merge run {run_id}")],
            )?;
        }

        let missing_files = Self::verify_actual_files(&destination, &tasks);
        if !missing_files.is_empty() {
            warn!(run_id, count = missing_files.len(), "actual_files verification found missing files");
        }

        self.write_summary(&destination, &run, &worker_reports, &missing_files)?;

        Ok(MergeReport {
            destination,
            worker_reports,
            missing_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "t@t.com"],
            vec!["config", "user.name", "T"],
        ] {
            StdCommand::new("git").args(&args).current_dir(dir).output().unwrap();
        }
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "initial"]).current_dir(dir).output().unwrap();
    }

    #[test]
    fn deny_prefixes_reject_internal_paths() {
        assert!(Merger::is_denied("coordination/src/lib.rs"));
        assert!(Merger::is_denied(".git/hooks/pre-commit"));
        assert!(!Merger::is_denied("src/app.rs"));
    }

    #[test]
    fn merges_a_single_clean_worker_branch() {
        let source = tempfile::tempdir().unwrap();
        init_repo(source.path());

        let worker_repo = tempfile::tempdir().unwrap();
        let wt_mgr = WorktreeManager::new(source.path());
        let wt_dir = worker_repo.path().join("wt");
        wt_mgr.create_worktree(&wt_dir, "swarm/run-x/worker-1", "main").unwrap();
        std::fs::write(wt_dir.join("feature.txt"), "new feature").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(&wt_dir).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "Task 1: add feature"])
            .current_dir(&wt_dir)
            .output()
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        let mut store = CoordinationStore::open_in_memory().unwrap();
        let run_id = store
            .start_run("devplan", &format!("{}/PLAN.md", dest.path().display()), "h1", "", 1)
            .unwrap();
        store
            .register_worker(&run_id, 1, 1, "swarm/run-x/worker-1", &wt_dir.to_string_lossy())
            .unwrap();

        let mut config = SwarmConfig::default();
        config.project_name = Some("proj".to_string());
        config.projects_base = Some(dest.path().to_path_buf());
        let merger = Merger::new(config);

        let report = merger.run(&store, &run_id).unwrap();
        assert_eq!(report.destination, dest.path().join("proj"));
        assert!(report.destination.join("feature.txt").exists());
        assert_eq!(report.worker_reports.len(), 1);
        assert!(report.worker_reports[0].merged_cleanly);
    }
}
