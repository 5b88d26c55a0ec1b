//! Detached worker process spawning and liveness probing (§4.3, §4.4).
//!
//! Workers are spawned as fully detached children so that an operator's
//! coordinator process (`swarmctl start`) can exit without killing any
//! in-flight worker, and so the scheduler can later reattach to a run purely
//! from Coordination Store state.

use std::path::Path;
use std::process::{Command, Stdio};

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{CoordError, CoordResult};

/// Spawn `swarm-worker` detached: stdin closed, stdout/stderr redirected to
/// `log_path`, placed in its own session so it survives the coordinator's
/// exit. Returns the child's PID as recorded by the OS, which the caller
/// persists via `CoordinationStore::update_worker_pid`.
pub fn spawn_detached_worker(
    worker_binary: &Path,
    args: &[String],
    log_path: &Path,
    cwd: &Path,
) -> CoordResult<u32> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::File::create(log_path)?;
    let log_file_err = log_file.try_clone()?;

    let binary_str = worker_binary.to_string_lossy().into_owned();
    let mut shell_cmd = format!("exec {}", shell_quote(&binary_str));
    for arg in args {
        shell_cmd.push(' ');
        shell_cmd.push_str(&shell_quote(arg));
    }

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(shell_cmd)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                // New session: detach from the coordinator's controlling
                // terminal and process group so SIGHUP/SIGINT to the
                // coordinator's shell doesn't reach the worker.
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }
    }

    let child = cmd
        .spawn()
        .map_err(|e| CoordError::git("spawn worker", e.to_string()))?;
    let pid = child.id();
    // Detach: we don't want to wait on this child or keep the handle open.
    std::mem::drop(child);
    Ok(pid)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Liveness probe: `kill(pid, 0)` succeeds iff a process with that PID
/// exists and is visible to us, without actually signalling it.
pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Build the argv the worker binary expects: `--run-id`, `--worker-num`,
/// `--ralph-dir`.
pub fn worker_args(run_id: &str, worker_num: u32, ralph_dir: &Path) -> Vec<String> {
    vec![
        "--run-id".to_string(),
        run_id.to_string(),
        "--worker-num".to_string(),
        worker_num.to_string(),
        "--ralph-dir".to_string(),
        ralph_dir.to_string_lossy().into_owned(),
    ]
}
