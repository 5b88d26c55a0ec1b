//! The Coordination Store (§4.1): a single-writer, serialisable
//! transactional store backed by SQLite. Every mutating operation commits
//! atomically or leaves state unchanged.

use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{CoordError, CoordResult};
use crate::store::schema;
use crate::store::types::{
    AddTaskOutcome, LockAcquisition, LockConflict, Run, RunStatus, Task, TaskStatus, Worker,
    WorkerStatus,
};

const CLAIM_MAX_ATTEMPTS: u32 = 20;
const CLAIM_BASE_DELAY_MS: u64 = 100;
const CLAIM_BACKOFF: f64 = 1.5;

/// A task handed to a worker by [`CoordinationStore::claim_task`].
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: i64,
    pub task_text: String,
    pub estimated_files: Vec<String>,
    pub devplan_line: Option<u32>,
}

pub struct CoordinationStore {
    conn: Connection,
}

impl CoordinationStore {
    /// Open (creating if absent) the coordination store at `path`, applying
    /// the embedded schema migration.
    pub fn open(path: impl AsRef<Path>) -> CoordResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory store, used by unit tests.
    #[cfg(test)]
    pub fn open_in_memory() -> CoordResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    fn parse_ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    // ---------------------------------------------------------------- runs

    pub fn start_run(
        &mut self,
        source_type: &str,
        source_path: &str,
        source_hash: &str,
        prompt: &str,
        worker_count: u32,
    ) -> CoordResult<String> {
        let run_id = format!("run-{}", uuid::Uuid::new_v4().simple());
        let now = Self::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO runs (run_id, status, source_hash, source_path, worker_count,
                total_tasks, completed_tasks, failed_tasks, started_at, completed_at)
             VALUES (?1, 'running', ?2, ?3, ?4, 0, 0, 0, ?5, NULL)",
            rusqlite::params![run_id, source_hash, source_path, worker_count, now],
        )?;
        tx.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![format!("run:{run_id}:prompt"), prompt],
        )?;
        tx.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![format!("run:{run_id}:source_type"), source_type],
        )?;
        tx.commit()?;
        Ok(run_id)
    }

    pub fn find_existing_run(&self, source_hash: &str) -> CoordResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT run_id FROM runs WHERE source_hash = ?1 AND status = 'running'
                 ORDER BY started_at DESC LIMIT 1",
                [source_hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(CoordError::from)
    }

    pub fn get_run(&self, run_id: &str) -> CoordResult<Option<Run>> {
        self.conn
            .query_row(
                "SELECT run_id, status, source_hash, source_path, worker_count,
                        total_tasks, completed_tasks, failed_tasks, started_at, completed_at
                 FROM runs WHERE run_id = ?1",
                [run_id],
                Self::row_to_run,
            )
            .optional()
            .map_err(CoordError::from)
    }

    pub fn list_runs(&self) -> CoordResult<Vec<Run>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, status, source_hash, source_path, worker_count,
                    total_tasks, completed_tasks, failed_tasks, started_at, completed_at
             FROM runs ORDER BY started_at DESC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
        let started_at: String = row.get(8)?;
        let completed_at: Option<String> = row.get(9)?;
        Ok(Run {
            run_id: row.get(0)?,
            status: RunStatus::parse(&row.get::<_, String>(1)?),
            source_hash: row.get(2)?,
            source_path: row.get(3)?,
            worker_count: row.get(4)?,
            total_tasks: row.get(5)?,
            completed_tasks: row.get(6)?,
            failed_tasks: row.get(7)?,
            started_at: Self::parse_ts(&started_at),
            completed_at: completed_at.as_deref().map(Self::parse_ts),
        })
    }

    pub fn mark_run_interrupted(&self, run_id: &str) -> CoordResult<()> {
        self.conn.execute(
            "UPDATE runs SET status = 'interrupted' WHERE run_id = ?1 AND status = 'running'",
            [run_id],
        )?;
        Ok(())
    }

    /// Mark `run_id` completed if no non-completed task remains (§3 run
    /// lifecycle). `complete_task` already does this inline for the task it
    /// just finished; this is the same check called from the scheduler side,
    /// for paths that change task status without going through
    /// `complete_task` — `resume_run`'s in-progress-to-completed promotion,
    /// and the `SchedulerOutcome::Completed` signal itself.
    pub fn finalize_run_if_complete(&mut self, run_id: &str) -> CoordResult<()> {
        let now = Self::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outstanding: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks WHERE run_id = ?1 AND status != 'completed'",
            [run_id],
            |row| row.get(0),
        )?;
        if outstanding == 0 {
            tx.execute(
                "UPDATE runs SET status = 'completed', completed_at = ?1
                 WHERE run_id = ?2 AND status = 'running'",
                rusqlite::params![now, run_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // --------------------------------------------------------------- tasks

    pub fn add_task(
        &mut self,
        run_id: &str,
        text: &str,
        estimated_files: &[String],
        devplan_line: Option<u32>,
        priority: i64,
    ) -> CoordResult<AddTaskOutcome> {
        let hash = crate::hash::task_hash(text);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let already_completed: bool = tx
            .query_row(
                "SELECT 1 FROM completed_tasks WHERE task_hash = ?1",
                [&hash],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if already_completed {
            tx.commit()?;
            return Ok(AddTaskOutcome::Skipped);
        }

        let next_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM tasks WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;
        let now = Self::now();
        let estimated_json = serde_json::to_string(estimated_files).unwrap_or_else(|_| "[]".into());
        tx.execute(
            "INSERT INTO tasks (id, run_id, task_text, task_hash, priority, estimated_files,
                actual_files, devplan_line, status, worker_id, stall_count, error_message,
                created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', ?7, 'pending', NULL, 0, NULL, ?8, NULL, NULL)",
            rusqlite::params![next_id, run_id, text, hash, priority, estimated_json, devplan_line, now],
        )?;
        tx.execute(
            "UPDATE runs SET total_tasks = (SELECT COUNT(*) FROM tasks WHERE run_id = ?1)
             WHERE run_id = ?1",
            [run_id],
        )?;
        tx.commit()?;
        Ok(AddTaskOutcome::Inserted(next_id))
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let estimated_files: String = row.get(5)?;
        let actual_files: String = row.get(6)?;
        let created_at: String = row.get(12)?;
        let started_at: Option<String> = row.get(13)?;
        let completed_at: Option<String> = row.get(14)?;
        Ok(Task {
            id: row.get(0)?,
            run_id: row.get(1)?,
            task_text: row.get(2)?,
            task_hash: row.get(3)?,
            priority: row.get(4)?,
            estimated_files: serde_json::from_str(&estimated_files).unwrap_or_default(),
            actual_files: serde_json::from_str(&actual_files).unwrap_or_default(),
            devplan_line: row.get(7)?,
            status: TaskStatus::parse(&row.get::<_, String>(8)?),
            worker_id: row.get(9)?,
            stall_count: row.get(10)?,
            error_message: row.get(11)?,
            created_at: CoordinationStore::parse_ts(&created_at),
            started_at: started_at.as_deref().map(CoordinationStore::parse_ts),
            completed_at: completed_at.as_deref().map(CoordinationStore::parse_ts),
        })
    }

    const TASK_COLUMNS: &'static str = "id, run_id, task_text, task_hash, priority, estimated_files,
        actual_files, devplan_line, status, worker_id, stall_count, error_message,
        created_at, started_at, completed_at";

    pub fn get_task(&self, run_id: &str, task_id: i64) -> CoordResult<Option<Task>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE run_id = ?1 AND id = ?2", Self::TASK_COLUMNS),
                rusqlite::params![run_id, task_id],
                Self::row_to_task,
            )
            .optional()
            .map_err(CoordError::from)
    }

    pub fn list_tasks(&self, run_id: &str) -> CoordResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE run_id = ?1 ORDER BY priority, id",
            Self::TASK_COLUMNS
        ))?;
        let rows = stmt
            .query_map([run_id], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Claim the lowest-priority, lowest-id pending task for `worker_id`'s
    /// run. Retries `SQLITE_BUSY` contention with bounded exponential
    /// backoff; re-verifies the winning row belongs to `worker_id` after
    /// commit per §4.1.
    pub fn claim_task(&mut self, worker_id: &str) -> CoordResult<Option<ClaimedTask>> {
        let run_id: String = self
            .conn
            .query_row(
                "SELECT run_id FROM workers WHERE id = ?1",
                [worker_id],
                |row| row.get(0),
            )
            .map_err(|_| CoordError::NotFound(format!("worker {worker_id}")))?;

        let mut delay = Duration::from_millis(CLAIM_BASE_DELAY_MS);
        for attempt in 0..CLAIM_MAX_ATTEMPTS {
            match self.try_claim_once(&run_id, worker_id) {
                Ok(outcome) => return Ok(outcome),
                Err(CoordError::Store(e)) if Self::is_busy(&e) => {
                    warn!(attempt, run_id = %run_id, "claim_task contention, retrying");
                    thread::sleep(delay);
                    delay = delay.mul_f64(CLAIM_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoordError::Busy {
            attempts: CLAIM_MAX_ATTEMPTS,
        })
    }

    fn is_busy(e: &rusqlite::Error) -> bool {
        matches!(e, rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::DatabaseBusy
                || code.code == rusqlite::ErrorCode::DatabaseLocked)
    }

    fn try_claim_once(&mut self, run_id: &str, worker_id: &str) -> CoordResult<Option<ClaimedTask>> {
        let now = Self::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let picked: Option<i64> = tx
            .query_row(
                "SELECT id FROM tasks WHERE run_id = ?1 AND status = 'pending'
                 ORDER BY priority, id LIMIT 1",
                [run_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(task_id) = picked else {
            tx.commit()?;
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE tasks SET status = 'in_progress', worker_id = ?1, started_at = ?2
             WHERE run_id = ?3 AND id = ?4 AND status = 'pending'",
            rusqlite::params![worker_id, now, run_id, task_id],
        )?;
        if changed != 1 {
            // Lost the race to another claimer inside the same busy window.
            tx.commit()?;
            return Ok(None);
        }

        tx.execute(
            "UPDATE workers SET status = 'in_progress', current_task_id = ?1 WHERE id = ?2",
            rusqlite::params![task_id, worker_id],
        )?;

        // Re-verify per §4.1: after commit, the winning row must still show
        // this worker as owner (SQLite's single-writer semantics make this
        // always true within one BEGIN IMMEDIATE transaction, but the check
        // is kept explicit so the contract holds even if the storage engine
        // changes).
        let (text, estimated_files, devplan_line, owner): (String, String, Option<u32>, String) = tx
            .query_row(
                "SELECT task_text, estimated_files, devplan_line, worker_id FROM tasks
                 WHERE run_id = ?1 AND id = ?2",
                rusqlite::params![run_id, task_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        tx.commit()?;

        if owner != worker_id {
            return Ok(None);
        }

        Ok(Some(ClaimedTask {
            task_id,
            task_text: text,
            estimated_files: serde_json::from_str(&estimated_files).unwrap_or_default(),
            devplan_line,
        }))
    }

    pub fn complete_task(
        &mut self,
        worker_id: &str,
        task_id: i64,
        actual_files: &[String],
    ) -> CoordResult<()> {
        let run_id: String = self
            .conn
            .query_row(
                "SELECT run_id FROM workers WHERE id = ?1",
                [worker_id],
                |row| row.get(0),
            )
            .map_err(|_| CoordError::NotFound(format!("worker {worker_id}")))?;

        let now = Self::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let task_text: Option<String> = tx
            .query_row(
                "SELECT task_text FROM tasks WHERE run_id = ?1 AND id = ?2 AND worker_id = ?3
                 AND status = 'in_progress'",
                rusqlite::params![run_id, task_id, worker_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(task_text) = task_text else {
            tx.commit()?;
            debug!(run_id, task_id, worker_id, "complete_task: no matching in_progress row");
            return Ok(());
        };

        let actual_json = serde_json::to_string(actual_files).unwrap_or_else(|_| "[]".into());
        tx.execute(
            "UPDATE tasks SET status = 'completed', actual_files = ?1, completed_at = ?2
             WHERE run_id = ?3 AND id = ?4",
            rusqlite::params![actual_json, now, run_id, task_id],
        )?;

        let task_hash = crate::hash::task_hash(&task_text);
        let source_hash: String = tx.query_row(
            "SELECT source_hash FROM runs WHERE run_id = ?1",
            [&run_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO completed_tasks (task_hash, task_text, source_hash, completed_at, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![task_hash, task_text, source_hash, now, run_id],
        )?;

        tx.execute(
            "UPDATE runs SET completed_tasks = completed_tasks + 1 WHERE run_id = ?1",
            [&run_id],
        )?;
        tx.execute(
            "UPDATE workers SET status = 'idle', current_task_id = NULL WHERE id = ?1",
            [worker_id],
        )?;

        let (total, completed, outstanding): (u32, u32, i64) = tx.query_row(
            "SELECT total_tasks, completed_tasks,
                    (SELECT COUNT(*) FROM tasks WHERE run_id = ?1 AND status != 'completed')
             FROM runs WHERE run_id = ?1",
            [&run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if completed >= total || outstanding == 0 {
            tx.execute(
                "UPDATE runs SET status = 'completed', completed_at = ?1
                 WHERE run_id = ?2 AND status = 'running'",
                rusqlite::params![now, run_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn fail_task(&mut self, worker_id: &str, task_id: i64, error: &str) -> CoordResult<()> {
        let run_id: String = self
            .conn
            .query_row(
                "SELECT run_id FROM workers WHERE id = ?1",
                [worker_id],
                |row| row.get(0),
            )
            .map_err(|_| CoordError::NotFound(format!("worker {worker_id}")))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'failed', error_message = ?1
             WHERE run_id = ?2 AND id = ?3 AND worker_id = ?4 AND status = 'in_progress'",
            rusqlite::params![error, run_id, task_id, worker_id],
        )?;
        if changed == 1 {
            tx.execute(
                "UPDATE runs SET failed_tasks = failed_tasks + 1 WHERE run_id = ?1",
                [&run_id],
            )?;
        }
        tx.execute(
            "UPDATE workers SET status = 'idle', current_task_id = NULL WHERE id = ?1",
            [worker_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Requeue an in_progress task back to pending with `stall_count+=1`,
    /// without touching `failed_tasks` (§4.3 step c: a lock conflict is not
    /// a failure, just contention). Frees the worker row too.
    pub fn requeue_task(&mut self, worker_id: &str, task_id: i64) -> CoordResult<()> {
        let run_id: String = self
            .conn
            .query_row(
                "SELECT run_id FROM workers WHERE id = ?1",
                [worker_id],
                |row| row.get(0),
            )
            .map_err(|_| CoordError::NotFound(format!("worker {worker_id}")))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE tasks SET status = 'pending', worker_id = NULL, stall_count = stall_count + 1
             WHERE run_id = ?1 AND id = ?2 AND worker_id = ?3 AND status = 'in_progress'",
            rusqlite::params![run_id, task_id, worker_id],
        )?;
        tx.execute(
            "UPDATE workers SET status = 'idle', current_task_id = NULL WHERE id = ?1",
            [worker_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn retry_failed(&mut self, run_id: &str, max_retries: u32) -> CoordResult<u32> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'pending', worker_id = NULL, error_message = NULL,
                stall_count = stall_count + 1
             WHERE run_id = ?1 AND status = 'failed' AND stall_count < ?2",
            rusqlite::params![run_id, max_retries],
        )?;
        tx.commit()?;
        Ok(changed as u32)
    }

    // ---------------------------------------------------------- file locks

    pub fn acquire_locks(
        &mut self,
        run_id: &str,
        worker_id: &str,
        task_id: i64,
        patterns: &[String],
    ) -> CoordResult<LockAcquisition> {
        let now = Self::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut result = LockAcquisition::default();
        for pattern in patterns {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO file_locks (run_id, pattern, worker_id, task_id, acquired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![run_id, pattern, worker_id, task_id, now],
            )?;
            if changed == 1 {
                result.acquired.push(pattern.clone());
            } else {
                let holder: String = tx.query_row(
                    "SELECT worker_id FROM file_locks WHERE run_id = ?1 AND pattern = ?2",
                    rusqlite::params![run_id, pattern],
                    |row| row.get(0),
                )?;
                result.conflicts.push(LockConflict {
                    pattern: pattern.clone(),
                    holder,
                });
            }
        }
        tx.commit()?;
        Ok(result)
    }

    pub fn release_locks(&mut self, worker_id: &str) -> CoordResult<()> {
        self.conn
            .execute("DELETE FROM file_locks WHERE worker_id = ?1", [worker_id])?;
        Ok(())
    }

    pub fn check_conflicts(&self, run_id: &str, pattern: &str) -> CoordResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT worker_id FROM file_locks WHERE run_id = ?1 AND pattern = ?2",
                rusqlite::params![run_id, pattern],
                |row| row.get(0),
            )
            .optional()
            .map_err(CoordError::from)
    }

    // ------------------------------------------------------------- workers

    pub fn register_worker(
        &mut self,
        run_id: &str,
        worker_num: u32,
        pid: u32,
        branch_name: &str,
        work_dir: &str,
    ) -> CoordResult<String> {
        let worker_id = format!("worker-{}", uuid::Uuid::new_v4().simple());
        let now = Self::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO workers (id, run_id, worker_num, pid, branch_name, status,
                current_task_id, work_dir, started_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5, 'idle', NULL, ?6, ?7, ?7)",
            rusqlite::params![worker_id, run_id, worker_num, pid, branch_name, work_dir, now],
        )?;
        tx.execute(
            "INSERT INTO worker_registry (worker_id, run_id, worker_num, pid, started_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![worker_id, run_id, worker_num, pid, now],
        )?;
        tx.commit()?;
        Ok(worker_id)
    }

    pub fn update_worker_pid(&mut self, worker_id: &str, pid: u32) -> CoordResult<()> {
        self.conn.execute(
            "UPDATE workers SET pid = ?1 WHERE id = ?2",
            rusqlite::params![pid, worker_id],
        )?;
        self.conn.execute(
            "UPDATE worker_registry SET pid = ?1 WHERE worker_id = ?2",
            rusqlite::params![pid, worker_id],
        )?;
        Ok(())
    }

    pub fn worker_heartbeat(&mut self, worker_id: &str) -> CoordResult<()> {
        let now = Self::now();
        self.conn.execute(
            "UPDATE workers SET last_heartbeat = ?1 WHERE id = ?2",
            rusqlite::params![now, worker_id],
        )?;
        self.conn.execute(
            "UPDATE worker_registry SET last_heartbeat = ?1 WHERE worker_id = ?2",
            rusqlite::params![now, worker_id],
        )?;
        Ok(())
    }

    pub fn set_worker_status(&mut self, worker_id: &str, status: WorkerStatus) -> CoordResult<()> {
        self.conn.execute(
            "UPDATE workers SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.as_str(), worker_id],
        )?;
        Ok(())
    }

    fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<Worker> {
        let started_at: String = row.get(8)?;
        let last_heartbeat: String = row.get(9)?;
        Ok(Worker {
            id: row.get(0)?,
            run_id: row.get(1)?,
            worker_num: row.get(2)?,
            pid: row.get(3)?,
            branch_name: row.get(4)?,
            status: WorkerStatus::parse(&row.get::<_, String>(5)?),
            current_task_id: row.get(6)?,
            work_dir: row.get(7)?,
            started_at: CoordinationStore::parse_ts(&started_at),
            last_heartbeat: CoordinationStore::parse_ts(&last_heartbeat),
        })
    }

    const WORKER_COLUMNS: &'static str =
        "id, run_id, worker_num, pid, branch_name, status, current_task_id, work_dir, started_at, last_heartbeat";

    pub fn get_worker(&self, worker_id: &str) -> CoordResult<Option<Worker>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM workers WHERE id = ?1", Self::WORKER_COLUMNS),
                [worker_id],
                Self::row_to_worker,
            )
            .optional()
            .map_err(CoordError::from)
    }

    pub fn list_workers(&self, run_id: &str) -> CoordResult<Vec<Worker>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM workers WHERE run_id = ?1 ORDER BY worker_num",
            Self::WORKER_COLUMNS
        ))?;
        let rows = stmt
            .query_map([run_id], Self::row_to_worker)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Dead-worker sweep: release locks, requeue the task, mark stopped for
    /// every worker whose heartbeat is older than `threshold`. Also reaps
    /// orphan in_progress tasks whose owning worker row is already stopped
    /// or missing (the scheduler's orphan reaper, §4.4).
    pub fn cleanup_stale_workers(&mut self, run_id: &str, threshold: Duration) -> CoordResult<u32> {
        let cutoff = (Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_default())
            .to_rfc3339();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM workers WHERE run_id = ?1 AND status != 'stopped' AND last_heartbeat < ?2",
            )?;
            stmt.query_map(rusqlite::params![run_id, cutoff], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut reaped = 0u32;
        for worker_id in &stale_ids {
            Self::reap_worker_tx(&tx, run_id, worker_id)?;
            reaped += 1;
        }

        // Orphan reaper: any in_progress task whose worker is stopped/missing.
        let orphan_task_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT t.id FROM tasks t
                 LEFT JOIN workers w ON w.id = t.worker_id
                 WHERE t.run_id = ?1 AND t.status = 'in_progress'
                   AND (w.id IS NULL OR w.status = 'stopped')",
            )?;
            stmt.query_map([run_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        for task_id in orphan_task_ids {
            tx.execute(
                "UPDATE tasks SET status = 'pending', worker_id = NULL, stall_count = stall_count + 1
                 WHERE run_id = ?1 AND id = ?2 AND status = 'in_progress'",
                rusqlite::params![run_id, task_id],
            )?;
        }

        tx.commit()?;
        Ok(reaped)
    }

    fn reap_worker_tx(tx: &rusqlite::Transaction, run_id: &str, worker_id: &str) -> CoordResult<()> {
        tx.execute(
            "UPDATE tasks SET status = 'pending', worker_id = NULL, stall_count = stall_count + 1
             WHERE run_id = ?1 AND worker_id = ?2 AND status = 'in_progress'",
            rusqlite::params![run_id, worker_id],
        )?;
        tx.execute("DELETE FROM file_locks WHERE worker_id = ?1", [worker_id])?;
        tx.execute(
            "UPDATE workers SET status = 'stopped', current_task_id = NULL WHERE id = ?1",
            [worker_id],
        )?;
        Ok(())
    }

    // --------------------------------------------------------------- resume

    /// Crash-recovery (§4.1): heal worker/task/lock state for `run_id` and
    /// set it back to running. `started_at` is preserved.
    pub fn resume_run(&mut self, run_id: &str) -> CoordResult<()> {
        let now = Self::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE workers SET status = 'stopped', current_task_id = NULL WHERE run_id = ?1",
            [run_id],
        )?;
        tx.execute("DELETE FROM file_locks WHERE run_id = ?1", [run_id])?;

        let in_progress: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, task_text FROM tasks WHERE run_id = ?1 AND status = 'in_progress'",
            )?;
            stmt.query_map([run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?
        };

        for (task_id, task_text) in in_progress {
            let hash = crate::hash::task_hash(&task_text);
            let completed_at: Option<String> = tx
                .query_row(
                    "SELECT completed_at FROM completed_tasks WHERE task_hash = ?1",
                    [&hash],
                    |row| row.get(0),
                )
                .optional()?;
            match completed_at {
                Some(ts) => {
                    tx.execute(
                        "UPDATE tasks SET status = 'completed', worker_id = NULL, completed_at = ?1
                         WHERE run_id = ?2 AND id = ?3",
                        rusqlite::params![ts, run_id, task_id],
                    )?;
                    tx.execute(
                        "UPDATE runs SET completed_tasks = completed_tasks + 1 WHERE run_id = ?1",
                        [run_id],
                    )?;
                }
                None => {
                    tx.execute(
                        "UPDATE tasks SET status = 'pending', worker_id = NULL,
                            stall_count = stall_count + 1
                         WHERE run_id = ?1 AND id = ?2",
                        rusqlite::params![run_id, task_id],
                    )?;
                }
            }
        }

        tx.execute(
            "UPDATE runs SET status = 'running', completed_at = NULL WHERE run_id = ?1",
            [run_id],
        )?;
        let _ = now;
        tx.commit()?;
        Ok(())
    }

    // ----------------------------------------------------------- dedup/cost

    pub fn is_task_completed(&self, task_hash: &str) -> CoordResult<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM completed_tasks WHERE task_hash = ?1",
                [task_hash],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false))
    }

    pub fn get_completed_task_hashes(&self, source_hash: &str) -> CoordResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT task_hash FROM completed_tasks WHERE source_hash = ?1")?;
        let rows = stmt
            .query_map([source_hash], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn record_task_cost(
        &mut self,
        run_id: &str,
        task_id: i64,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost: f64,
    ) -> CoordResult<()> {
        let now = Self::now();
        self.conn.execute(
            "INSERT INTO task_costs (task_id, run_id, prompt_tokens, completion_tokens, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![task_id, run_id, prompt_tokens, completion_tokens, cost, now],
        )?;
        Ok(())
    }

    pub fn cost_rollup(&self, run_id: &str) -> CoordResult<(i64, i64, f64)> {
        self.conn.query_row(
            "SELECT COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0),
                    COALESCE(SUM(cost), 0.0)
             FROM task_costs WHERE run_id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        ).map_err(CoordError::from)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{AddTaskOutcome, TaskStatus, WorkerStatus};

    fn store() -> CoordinationStore {
        CoordinationStore::open_in_memory().unwrap()
    }

    fn run_with_workers(store: &mut CoordinationStore, n: u32) -> (String, Vec<String>) {
        let run_id = store.start_run("devplan", "PLAN.md", "h", "", n).unwrap();
        let workers = (1..=n)
            .map(|num| {
                store
                    .register_worker(&run_id, num, 1000 + num, &format!("swarm/{run_id}/worker-{num}"), "/tmp/x")
                    .unwrap()
            })
            .collect();
        (run_id, workers)
    }

    // §8 item 1: at-most-one-execution. Distinct workers racing claim_task
    // against the same pending task never both win it.
    #[test]
    fn at_most_one_worker_claims_a_given_task() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 2);
        store.add_task(&run_id, "only task", &[], None, 0).unwrap();

        let first = store.claim_task(&workers[0]).unwrap();
        let second = store.claim_task(&workers[1]).unwrap();

        assert!(first.is_some());
        assert!(second.is_none(), "a second claimer must not see the same task");

        let task = store.get_task(&run_id, first.unwrap().task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::InProgress));
        assert_eq!(task.worker_id.as_deref(), Some(workers[0].as_str()));
    }

    #[test]
    fn claim_task_returns_lowest_priority_then_lowest_id() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        store.add_task(&run_id, "low prio, added first", &[], None, 5).unwrap();
        store.add_task(&run_id, "high prio, added second", &[], None, 1).unwrap();

        let claimed = store.claim_task(&workers[0]).unwrap().unwrap();
        assert_eq!(claimed.task_text, "high prio, added second");
    }

    #[test]
    fn claim_task_returns_none_when_no_pending_tasks() {
        let mut store = store();
        let (_run_id, workers) = run_with_workers(&mut store, 1);
        assert!(store.claim_task(&workers[0]).unwrap().is_none());
    }

    // §8 item 2: lock mutual exclusion.
    #[test]
    fn acquire_locks_is_mutually_exclusive_per_pattern() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 2);
        let t1 = store.add_task(&run_id, "task a", &[], None, 0).unwrap();
        let t2 = store.add_task(&run_id, "task b", &[], None, 1).unwrap();
        let (AddTaskOutcome::Inserted(t1), AddTaskOutcome::Inserted(t2)) = (t1, t2) else {
            panic!("expected both tasks inserted");
        };

        let first = store
            .acquire_locks(&run_id, &workers[0], t1, &["src/a.py".to_string()])
            .unwrap();
        assert_eq!(first.acquired, vec!["src/a.py".to_string()]);
        assert!(first.conflicts.is_empty());

        let second = store
            .acquire_locks(&run_id, &workers[1], t2, &["src/a.py".to_string()])
            .unwrap();
        assert!(second.acquired.is_empty());
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].holder, workers[0]);

        assert_eq!(
            store.check_conflicts(&run_id, "src/a.py").unwrap().as_deref(),
            Some(workers[0].as_str())
        );
    }

    #[test]
    fn release_locks_drops_every_lock_held_by_a_worker() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(t1) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store
            .acquire_locks(&run_id, &workers[0], t1, &["a".into(), "b".into()])
            .unwrap();
        store.release_locks(&workers[0]).unwrap();
        assert!(store.check_conflicts(&run_id, "a").unwrap().is_none());
        assert!(store.check_conflicts(&run_id, "b").unwrap().is_none());
    }

    // §8 item 3: idempotent completion / cross-run dedup.
    #[test]
    fn completed_task_hash_suppresses_future_add_task() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) =
            store.add_task(&run_id, "ship the feature", &[], None, 0).unwrap()
        else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store.complete_task(&workers[0], task_id, &["feature.rs".to_string()]).unwrap();

        assert!(store.is_task_completed(&crate::hash::task_hash("ship the feature")).unwrap());

        let run2 = store.start_run("devplan", "PLAN.md", "h2", "", 1).unwrap();
        let outcome = store.add_task(&run2, "ship the feature", &[], None, 0).unwrap();
        assert_eq!(outcome, AddTaskOutcome::Skipped);
        assert!(store.list_tasks(&run2).unwrap().is_empty());
    }

    #[test]
    fn complete_task_is_a_noop_for_the_wrong_worker() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 2);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        // worker 2 never claimed it; completing as worker 2 must not mark it done.
        store.complete_task(&workers[1], task_id, &[]).unwrap();
        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::InProgress));
    }

    // §8 item 4: resume preserves started_at.
    #[test]
    fn resume_run_preserves_started_at() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        store.add_task(&run_id, "t", &[], None, 0).unwrap();
        store.claim_task(&workers[0]).unwrap();

        let before = store.get_run(&run_id).unwrap().unwrap();
        store.mark_run_interrupted(&run_id).unwrap();
        store.resume_run(&run_id).unwrap();
        let after = store.get_run(&run_id).unwrap().unwrap();

        assert_eq!(before.started_at, after.started_at);
        assert!(matches!(after.status, RunStatus::Running));
    }

    #[test]
    fn resume_run_promotes_in_progress_task_already_in_completed_tasks() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) =
            store.add_task(&run_id, "duplicate text", &[], None, 0).unwrap()
        else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();

        // Simulate a different run having already completed identical task
        // text before this run's coordinator crashed mid-task.
        let other_run = store.start_run("devplan", "PLAN.md", "hother", "", 1).unwrap();
        let other_worker = store
            .register_worker(&other_run, 1, 999, "swarm/hother/worker-1", "/tmp/y")
            .unwrap();
        let AddTaskOutcome::Inserted(other_task) =
            store.add_task(&other_run, "duplicate text", &[], None, 0).unwrap()
        else {
            panic!()
        };
        store.claim_task(&other_worker).unwrap();
        store.complete_task(&other_worker, other_task, &[]).unwrap();

        store.resume_run(&run_id).unwrap();

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Completed));
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.completed_tasks, 1);
    }

    // `resume_run` promotes an in-progress task straight to completed
    // without going through `complete_task`, so when it was the run's last
    // outstanding task, `run.status` is left at `running` until something
    // calls `finalize_run_if_complete`.
    #[test]
    fn finalize_run_if_complete_closes_out_a_run_resume_run_left_running() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) =
            store.add_task(&run_id, "duplicate text", &[], None, 0).unwrap()
        else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();

        let other_run = store.start_run("devplan", "PLAN.md", "hother2", "", 1).unwrap();
        let other_worker = store
            .register_worker(&other_run, 1, 998, "swarm/hother2/worker-1", "/tmp/z")
            .unwrap();
        let AddTaskOutcome::Inserted(other_task) =
            store.add_task(&other_run, "duplicate text", &[], None, 0).unwrap()
        else {
            panic!()
        };
        store.claim_task(&other_worker).unwrap();
        store.complete_task(&other_worker, other_task, &[]).unwrap();

        store.resume_run(&run_id).unwrap();
        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Completed));
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert!(matches!(run.status, RunStatus::Running), "resume_run itself never flips run.status");

        store.finalize_run_if_complete(&run_id).unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert!(matches!(run.status, RunStatus::Completed));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn finalize_run_if_complete_is_a_noop_while_tasks_remain() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        store.add_task(&run_id, "t1", &[], None, 0).unwrap();
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t2", &[], None, 1).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store.complete_task(&workers[0], task_id, &[]).unwrap();

        store.finalize_run_if_complete(&run_id).unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert!(matches!(run.status, RunStatus::Running));
    }

    #[test]
    fn resume_run_requeues_in_progress_task_without_prior_completion() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();

        store.resume_run(&run_id).unwrap();

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Pending));
        assert_eq!(task.stall_count, 1);
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn resume_run_clears_worker_rows_and_locks() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store
            .acquire_locks(&run_id, &workers[0], task_id, &["a.rs".to_string()])
            .unwrap();

        store.resume_run(&run_id).unwrap();

        let worker = store.get_worker(&workers[0]).unwrap().unwrap();
        assert!(matches!(worker.status, WorkerStatus::Stopped));
        assert!(worker.current_task_id.is_none());
        assert!(store.check_conflicts(&run_id, "a.rs").unwrap().is_none());
    }

    // §8 item 5: worker-death ⇒ task-return.
    #[test]
    fn cleanup_stale_workers_requeues_task_and_releases_locks() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 2);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[1]).unwrap();
        store
            .acquire_locks(&run_id, &workers[1], task_id, &["x.rs".to_string()])
            .unwrap();

        let reaped = store.cleanup_stale_workers(&run_id, Duration::ZERO).unwrap();
        assert!(reaped >= 1);

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Pending));
        assert_eq!(task.stall_count, 1);
        assert!(store.check_conflicts(&run_id, "x.rs").unwrap().is_none());

        let worker = store.get_worker(&workers[1]).unwrap().unwrap();
        assert!(matches!(worker.status, WorkerStatus::Stopped));
    }

    #[test]
    fn cleanup_stale_workers_reaps_orphan_tasks_whose_worker_row_is_already_stopped() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store.set_worker_status(&workers[0], WorkerStatus::Stopped).unwrap();

        store.cleanup_stale_workers(&run_id, Duration::from_secs(3600)).unwrap();

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Pending));
    }

    // §8 item 6: completion monotonicity.
    #[test]
    fn run_totals_only_move_forward() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        store.add_task(&run_id, "one", &[], None, 0).unwrap();
        store.add_task(&run_id, "two", &[], None, 1).unwrap();

        let after_insert = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(after_insert.total_tasks, 2);
        assert_eq!(after_insert.completed_tasks, 0);

        let claimed = store.claim_task(&workers[0]).unwrap().unwrap();
        store.complete_task(&workers[0], claimed.task_id, &[]).unwrap();
        let after_complete = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(after_complete.completed_tasks, 1);
        assert!(after_complete.completed_tasks >= after_insert.completed_tasks);

        // Re-adding a third task only ever grows total_tasks.
        store.add_task(&run_id, "three", &[], None, 2).unwrap();
        let after_third = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(after_third.total_tasks, 3);
        assert!(after_third.total_tasks >= after_complete.total_tasks);
    }

    #[test]
    fn run_transitions_to_completed_once_every_task_is_terminal() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        store.add_task(&run_id, "only", &[], None, 0).unwrap();

        let claimed = store.claim_task(&workers[0]).unwrap().unwrap();
        store.complete_task(&workers[0], claimed.task_id, &[]).unwrap();

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert!(matches!(run.status, RunStatus::Completed));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn fail_task_increments_failed_tasks_and_frees_the_worker() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store.fail_task(&workers[0], task_id, "agent timed out").unwrap();

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Failed));
        assert_eq!(task.error_message.as_deref(), Some("agent timed out"));

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.failed_tasks, 1);

        let worker = store.get_worker(&workers[0]).unwrap().unwrap();
        assert!(matches!(worker.status, WorkerStatus::Idle));
        assert!(worker.current_task_id.is_none());
    }

    #[test]
    fn requeue_task_returns_to_pending_without_touching_failed_tasks() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();

        store.requeue_task(&workers[0], task_id).unwrap();

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Pending));
        assert_eq!(task.stall_count, 1);
        assert!(task.worker_id.is_none());

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.failed_tasks, 0);

        let worker = store.get_worker(&workers[0]).unwrap().unwrap();
        assert!(matches!(worker.status, WorkerStatus::Idle));
        assert!(worker.current_task_id.is_none());
    }

    #[test]
    fn retry_failed_resets_below_max_and_bumps_stall_count() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store.fail_task(&workers[0], task_id, "boom").unwrap();

        let reset = store.retry_failed(&run_id, 3).unwrap();
        assert_eq!(reset, 1);

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Pending));
        assert_eq!(task.stall_count, 1);
        assert!(task.error_message.is_none());
    }

    #[test]
    fn retry_failed_leaves_tasks_at_max_retries_alone() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store.fail_task(&workers[0], task_id, "boom").unwrap();
        store.retry_failed(&run_id, 0).unwrap();

        let task = store.get_task(&run_id, task_id).unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Failed));
    }

    #[test]
    fn find_existing_run_returns_latest_running_run_for_source_hash() {
        let mut store = store();
        let run1 = store.start_run("devplan", "PLAN.md", "shared-hash", "", 1).unwrap();
        assert_eq!(store.find_existing_run("shared-hash").unwrap(), Some(run1.clone()));

        store.mark_run_interrupted(&run1).unwrap();
        assert_eq!(store.find_existing_run("shared-hash").unwrap(), None);
    }

    #[test]
    fn task_cost_rollup_sums_across_records() {
        let mut store = store();
        let (run_id, _workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.record_task_cost(&run_id, task_id, 100, 50, 0.01).unwrap();
        store.record_task_cost(&run_id, task_id, 20, 10, 0.002).unwrap();

        let (prompt, completion, cost) = store.cost_rollup(&run_id).unwrap();
        assert_eq!(prompt, 120);
        assert_eq!(completion, 60);
        assert!((cost - 0.012).abs() < 1e-9);
    }

    #[test]
    fn worker_heartbeat_updates_last_heartbeat() {
        let mut store = store();
        let (_run_id, workers) = run_with_workers(&mut store, 1);
        let before = store.get_worker(&workers[0]).unwrap().unwrap().last_heartbeat;
        std::thread::sleep(Duration::from_millis(10));
        store.worker_heartbeat(&workers[0]).unwrap();
        let after = store.get_worker(&workers[0]).unwrap().unwrap().last_heartbeat;
        assert!(after >= before);
    }

    #[test]
    fn get_completed_task_hashes_scoped_to_source_hash() {
        let mut store = store();
        let (run_id, workers) = run_with_workers(&mut store, 1);
        let AddTaskOutcome::Inserted(task_id) = store.add_task(&run_id, "t", &[], None, 0).unwrap() else {
            panic!()
        };
        store.claim_task(&workers[0]).unwrap();
        store.complete_task(&workers[0], task_id, &[]).unwrap();

        let hashes = store.get_completed_task_hashes("h").unwrap();
        assert_eq!(hashes, vec![crate::hash::task_hash("t")]);
        assert!(store.get_completed_task_hashes("unrelated").unwrap().is_empty());
    }
}
