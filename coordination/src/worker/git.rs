//! Git worktree isolation for a single worker (§4.3): each worker operates
//! inside its own worktree, checked out on a dedicated branch, so two
//! workers never touch the same working directory.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::{CoordError, CoordResult};

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Branch a worker's worktree lives on: `swarm/<run_id>/worker-<n>`.
pub fn branch_name(run_id: &str, worker_num: u32) -> String {
    format!("swarm/{run_id}/worker-{worker_num}")
}

/// Thin wrapper over `git worktree`/`git log`/`git merge-base` invocations
/// against the repository rooted at `repo_root`.
pub struct WorktreeManager {
    repo_root: PathBuf,
    max_retries: u32,
}

impl WorktreeManager {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    fn run_git(&self, args: &[&str]) -> CoordResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| CoordError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoordError::git(args.join(" "), stderr.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_git_with_retry(&self, args: &[&str]) -> CoordResult<String> {
        let mut delay = RETRY_BASE_DELAY_MS;
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run_git(args) {
                Ok(out) => return Ok(out),
                Err(e) if attempt < self.max_retries => {
                    std::thread::sleep(Duration::from_millis(delay));
                    delay *= 2;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| CoordError::git("retry", "max retries exceeded")))
    }

    /// Determine the repository's default branch, preferring `base_branch`
    /// if given, otherwise asking the remote HEAD, falling back to `main`.
    pub fn default_branch(&self, base_branch: Option<&str>) -> String {
        if let Some(b) = base_branch {
            return b.to_string();
        }
        self.run_git(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .ok()
            .and_then(|s| s.rsplit('/').next().map(str::to_string))
            .unwrap_or_else(|| "main".to_string())
    }

    /// Create a worktree at `worktree_dir` on a fresh branch `branch`,
    /// based off `base_branch`. Idempotent: if the worktree directory
    /// already exists and is registered, returns immediately (crash-resume).
    pub fn create_worktree(
        &self,
        worktree_dir: &Path,
        branch: &str,
        base_branch: &str,
    ) -> CoordResult<()> {
        if worktree_dir.exists() {
            let existing = self.list_worktrees()?;
            if existing.iter().any(|p| p == worktree_dir) {
                return Ok(());
            }
        }
        if let Some(parent) = worktree_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dir_str = worktree_dir.to_string_lossy().into_owned();
        self.run_git_with_retry(&[
            "worktree",
            "add",
            "-b",
            branch,
            &dir_str,
            base_branch,
        ])?;
        Ok(())
    }

    fn list_worktrees(&self) -> CoordResult<Vec<PathBuf>> {
        let out = self.run_git(&["worktree", "list", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    /// Remove a worker's worktree after merge (best-effort; failures here
    /// don't invalidate a successful merge).
    pub fn remove_worktree(&self, worktree_dir: &Path) -> CoordResult<()> {
        let dir_str = worktree_dir.to_string_lossy().into_owned();
        self.run_git(&["worktree", "remove", "--force", &dir_str])?;
        Ok(())
    }

    /// Idempotency guard (§4.3, §8 item 5): has a commit titled
    /// `"Task <id>: "` already landed on `branch`? Used when resuming a run
    /// so a worker doesn't redo work an agent already committed before a
    /// crash.
    pub fn task_already_committed(&self, branch: &str, task_id: i64) -> CoordResult<bool> {
        let grep = format!("^Task {task_id}: ");
        match self.run_git(&[
            "log",
            branch,
            &format!("--grep={grep}"),
            "--format=%H",
            "-1",
        ]) {
            Ok(out) => Ok(!out.trim().is_empty()),
            Err(_) => Ok(false),
        }
    }

    /// Files changed in `branch` relative to its merge-base with
    /// `base_branch` — used both for `actual_files` verification and by the
    /// merger to enumerate what a worker touched.
    pub fn changed_files(&self, branch: &str, base_branch: &str) -> CoordResult<Vec<String>> {
        let merge_base = self.run_git(&["merge-base", base_branch, branch])?;
        let out = self.run_git(&["diff", "--name-only", &merge_base, branch])?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    pub fn current_commit(&self, branch: &str) -> CoordResult<String> {
        self.run_git(&["rev-parse", branch])
    }
}
