//! Row types for the coordination store (§3 of the specification).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "interrupted" => RunStatus::Interrupted,
            _ => RunStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Idle,
    InProgress,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::InProgress => "in_progress",
            WorkerStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => WorkerStatus::InProgress,
            "stopped" => WorkerStatus::Stopped,
            _ => WorkerStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub source_hash: String,
    pub source_path: String,
    pub worker_count: u32,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub run_id: String,
    pub task_text: String,
    pub task_hash: String,
    pub priority: i64,
    pub estimated_files: Vec<String>,
    pub actual_files: Vec<String>,
    pub devplan_line: Option<u32>,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub stall_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub run_id: String,
    pub worker_num: u32,
    pub pid: Option<u32>,
    pub branch_name: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<i64>,
    pub work_dir: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub run_id: String,
    pub pattern: String,
    pub worker_id: String,
    pub task_id: i64,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTask {
    pub task_hash: String,
    pub task_text: String,
    pub source_hash: String,
    pub completed_at: DateTime<Utc>,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCost {
    pub task_id: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Decoupled from [`Worker`] so stale liveness records can be reaped
/// independently of the authoritative task-ownership row (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistryEntry {
    pub worker_id: String,
    pub run_id: String,
    pub worker_num: u32,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Outcome of [`crate::store::CoordinationStore::add_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTaskOutcome {
    Inserted(i64),
    Skipped,
}

/// Outcome of a lock-acquisition attempt (§4.1 — partial acquisition is
/// permitted by design).
#[derive(Debug, Clone, Default)]
pub struct LockAcquisition {
    pub acquired: Vec<String>,
    pub conflicts: Vec<LockConflict>,
}

impl LockAcquisition {
    pub fn is_complete(&self, requested: &[String]) -> bool {
        self.conflicts.is_empty() && self.acquired.len() == requested.len()
    }

    pub fn got_none(&self) -> bool {
        self.acquired.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LockConflict {
    pub pattern: String,
    pub holder: String,
}

/// A single unchecked task line parsed out of a devplan markdown file,
/// handed from the Devplan Analyzer to `add_task`.
#[derive(Debug, Clone)]
pub struct ParsedTask {
    pub text: String,
    pub devplan_line: u32,
    pub priority: i64,
}
