//! Embedded schema migration, applied idempotently on every open (§6).

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id          TEXT PRIMARY KEY,
    status          TEXT NOT NULL,
    source_hash     TEXT NOT NULL,
    source_path     TEXT NOT NULL,
    worker_count    INTEGER NOT NULL,
    total_tasks     INTEGER NOT NULL DEFAULT 0,
    completed_tasks INTEGER NOT NULL DEFAULT 0,
    failed_tasks    INTEGER NOT NULL DEFAULT 0,
    started_at      TEXT NOT NULL,
    completed_at    TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id             INTEGER NOT NULL,
    run_id         TEXT NOT NULL REFERENCES runs(run_id),
    task_text      TEXT NOT NULL,
    task_hash      TEXT NOT NULL,
    priority       INTEGER NOT NULL,
    estimated_files TEXT NOT NULL DEFAULT '[]',
    actual_files   TEXT NOT NULL DEFAULT '[]',
    devplan_line   INTEGER,
    status         TEXT NOT NULL,
    worker_id      TEXT REFERENCES workers(id),
    stall_count    INTEGER NOT NULL DEFAULT 0,
    error_message  TEXT,
    created_at     TEXT NOT NULL,
    started_at     TEXT,
    completed_at   TEXT,
    PRIMARY KEY (run_id, id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_in_progress_unique
    ON tasks(run_id, id) WHERE status = 'in_progress';

CREATE INDEX IF NOT EXISTS idx_tasks_run_status ON tasks(run_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_hash ON tasks(task_hash);

CREATE TABLE IF NOT EXISTS workers (
    id               TEXT PRIMARY KEY,
    run_id           TEXT NOT NULL REFERENCES runs(run_id),
    worker_num       INTEGER NOT NULL,
    pid              INTEGER,
    branch_name      TEXT NOT NULL,
    status           TEXT NOT NULL,
    current_task_id  INTEGER,
    work_dir         TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    last_heartbeat   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workers_run_status ON workers(run_id, status);

CREATE TABLE IF NOT EXISTS file_locks (
    run_id      TEXT NOT NULL,
    pattern     TEXT NOT NULL,
    worker_id   TEXT NOT NULL,
    task_id     INTEGER NOT NULL,
    acquired_at TEXT NOT NULL,
    PRIMARY KEY (run_id, pattern)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_file_locks_run_pattern ON file_locks(run_id, pattern);

CREATE TABLE IF NOT EXISTS completed_tasks (
    task_hash    TEXT PRIMARY KEY,
    task_text    TEXT NOT NULL,
    source_hash  TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    run_id       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_completed_tasks_source_hash
    ON completed_tasks(source_hash, task_hash);

CREATE TABLE IF NOT EXISTS task_costs (
    task_id           INTEGER NOT NULL,
    run_id            TEXT NOT NULL,
    prompt_tokens     INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    cost              REAL NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_costs_run ON task_costs(run_id);

CREATE TABLE IF NOT EXISTS worker_registry (
    worker_id      TEXT PRIMARY KEY,
    run_id         TEXT NOT NULL,
    worker_num     INTEGER NOT NULL,
    pid            INTEGER NOT NULL,
    started_at     TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Apply PRAGMAs and the schema. Idempotent: safe to call on every open.
pub fn migrate(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 120_000i64)?;
    conn.pragma_update(None, "cache_size", -65536i64)?;
    conn.execute_batch(SCHEMA)
}
