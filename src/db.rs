use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension, Result, Row};

use crate::clock::format_instant;

pub const CURRENT_SCHEMA_VERSION: i64 = 3;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: [Migration; 3] = [
    Migration {
        version: 1,
        name: "task_history_v1",
        sql: r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    is_routine INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
    done_time TEXT NOT NULL,
    UNIQUE (task_id, done_time)
);

CREATE INDEX IF NOT EXISTS idx_task_owner ON task(owner);
CREATE INDEX IF NOT EXISTS idx_history_task_done_time ON history(task_id, done_time);
"#,
    },
    Migration {
        version: 2,
        name: "archival_jobs_v1",
        sql: r#"
CREATE TABLE IF NOT EXISTS scheduled_job (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    run_at TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS archival_snapshot (
    job_id TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    done_time TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    applied_at TEXT,
    PRIMARY KEY (job_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_scheduled_job_status_run_at
    ON scheduled_job(status, run_at);
CREATE INDEX IF NOT EXISTS idx_archival_snapshot_applied
    ON archival_snapshot(applied_at);
"#,
    },
    Migration {
        version: 3,
        name: "archival_drain_v1",
        sql: r#"
CREATE TABLE IF NOT EXISTS archival_drain (
    job_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    drained INTEGER NOT NULL,
    staged_at TEXT NOT NULL,
    committed_at TEXT
);

INSERT OR IGNORE INTO archival_drain (job_id, state, drained, staged_at, committed_at)
SELECT job_id, 'committed', COUNT(*), MIN(captured_at), MIN(captured_at)
FROM archival_snapshot
GROUP BY job_id;
"#,
    },
];

pub fn open_connection(path: &str) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    configure_for_speed(&conn)?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

fn configure_for_speed(conn: &Connection) -> Result<()> {
    conn.pragma_update(None::<DatabaseName>, "journal_mode", "WAL")?;
    conn.pragma_update(None::<DatabaseName>, "synchronous", "NORMAL")?;
    conn.pragma_update(None::<DatabaseName>, "foreign_keys", "ON")?;
    conn.pragma_update(None::<DatabaseName>, "temp_store", "MEMORY")?;
    conn.pragma_update(None::<DatabaseName>, "busy_timeout", 5000i64)?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"#,
    )?;

    for migration in MIGRATIONS {
        let already_applied: Option<i64> = tx
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![migration.version],
                |row| row.get(0),
            )
            .optional()?;

        if already_applied.is_some() {
            continue;
        }

        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.name,
                format_instant(time::OffsetDateTime::now_utc())
            ],
        )?;
    }

    tx.execute(
        r#"
INSERT INTO meta (key, value)
VALUES ('schema_version', ?1)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
        params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()
}

/// Shared durable handle. Guards are scoped to a single call site and never
/// held while calling into another component.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
        })
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: i64,
    pub owner: String,
    pub title: String,
    pub description: String,
    pub is_routine: bool,
    pub created_at: String,
}

pub struct NewTask<'a> {
    pub owner: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub is_routine: bool,
    pub created_at: &'a str,
}

const TASK_COLUMNS: &str = "id, owner, title, description, is_routine, created_at";

fn task_from_row(row: &Row<'_>) -> Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        is_routine: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

fn collect_tasks(conn: &Connection, sql: &str, ids: &[i64]) -> Result<Vec<TaskRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(ids.iter()))?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(task_from_row(row)?);
    }
    Ok(result)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub fn insert_task(conn: &Connection, args: &NewTask<'_>) -> Result<i64> {
    conn.execute(
        r#"
INSERT INTO task (owner, title, description, is_routine, created_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
        params![
            args.owner,
            args.title,
            args.description,
            args.is_routine as i64,
            args.created_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_task(conn: &Connection, id: i64) -> Result<Option<TaskRecord>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM task WHERE id = ?1"),
        params![id],
        task_from_row,
    )
    .optional()
}

pub fn update_task(conn: &Connection, id: i64, title: &str, description: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE task SET title = ?2, description = ?3 WHERE id = ?1",
        params![id, title, description],
    )?;
    Ok(changed > 0)
}

pub fn delete_task(conn: &Connection, id: i64) -> Result<bool> {
    let removed = conn.execute("DELETE FROM task WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

pub fn list_tasks(conn: &Connection) -> Result<Vec<TaskRecord>> {
    collect_tasks(
        conn,
        &format!("SELECT {TASK_COLUMNS} FROM task ORDER BY id ASC"),
        &[],
    )
}

pub fn list_tasks_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<TaskRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    collect_tasks(
        conn,
        &format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE id IN ({}) ORDER BY id ASC",
            placeholders(ids.len())
        ),
        ids,
    )
}

pub fn list_tasks_excluding(conn: &Connection, ids: &[i64]) -> Result<Vec<TaskRecord>> {
    if ids.is_empty() {
        return list_tasks(conn);
    }
    collect_tasks(
        conn,
        &format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE id NOT IN ({}) ORDER BY id ASC",
            placeholders(ids.len())
        ),
        ids,
    )
}

pub fn list_archived_reminders(conn: &Connection) -> Result<Vec<TaskRecord>> {
    collect_tasks(
        conn,
        &format!(
            r#"
SELECT {TASK_COLUMNS}
FROM task
WHERE is_routine = 0
  AND EXISTS (SELECT 1 FROM history WHERE history.task_id = task.id)
ORDER BY id ASC
"#
        ),
        &[],
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: i64,
    pub task_id: i64,
    pub done_time: String,
}

pub fn list_history(conn: &Connection, task_id: i64) -> Result<Vec<HistoryRecord>> {
    let mut stmt = conn.prepare(
        r#"
SELECT id, task_id, done_time
FROM history
WHERE task_id = ?1
ORDER BY done_time DESC, id DESC
"#,
    )?;
    let mut rows = stmt.query(params![task_id])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(HistoryRecord {
            id: row.get(0)?,
            task_id: row.get(1)?,
            done_time: row.get(2)?,
        });
    }
    Ok(result)
}

pub fn history_count(conn: &Connection, task_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM history WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )
}

pub fn latest_done_time(conn: &Connection, task_id: i64) -> Result<Option<String>> {
    conn.query_row(
        "SELECT MAX(done_time) FROM history WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )
}

/// Returns false when the same `(task_id, done_time)` row already exists.
pub fn append_history(conn: &Connection, task_id: i64, done_time: &str) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO history (task_id, done_time) VALUES (?1, ?2)",
        params![task_id, done_time],
    )?;
    Ok(inserted > 0)
}

/// Deletes the task's history only when it holds exactly one entry.
pub fn delete_sole_history(conn: &Connection, task_id: i64) -> Result<bool> {
    let removed = conn.execute(
        r#"
DELETE FROM history
WHERE task_id = ?1
  AND (SELECT COUNT(*) FROM history WHERE task_id = ?1) = 1
"#,
        params![task_id],
    )?;
    Ok(removed > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    pub run_at: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

const JOB_COLUMNS: &str =
    "id, kind, run_at, status, attempts, last_error, created_at, finished_at";

fn job_from_row(row: &Row<'_>) -> Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        run_at: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        created_at: row.get(6)?,
        finished_at: row.get(7)?,
    })
}

pub fn insert_job(
    conn: &Connection,
    id: &str,
    kind: &str,
    run_at: &str,
    status: &str,
    created_at: &str,
) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO scheduled_job (id, kind, run_at, status, attempts, created_at)
VALUES (?1, ?2, ?3, ?4, 0, ?5)
"#,
        params![id, kind, run_at, status, created_at],
    )?;
    Ok(())
}

pub fn get_job(conn: &Connection, id: &str) -> Result<Option<JobRecord>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM scheduled_job WHERE id = ?1"),
        params![id],
        job_from_row,
    )
    .optional()
}

pub fn list_jobs(conn: &Connection) -> Result<Vec<JobRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM scheduled_job ORDER BY run_at ASC, id ASC"
    ))?;
    let mut rows = stmt.query([])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(job_from_row(row)?);
    }
    Ok(result)
}

pub fn next_due_job(conn: &Connection, status: &str, now: &str) -> Result<Option<JobRecord>> {
    conn.query_row(
        &format!(
            r#"
SELECT {JOB_COLUMNS}
FROM scheduled_job
WHERE status = ?1 AND run_at <= ?2
ORDER BY run_at ASC, id ASC
LIMIT 1
"#
        ),
        params![status, now],
        job_from_row,
    )
    .optional()
}

/// Compare-and-set on the status column; false when another caller won.
pub fn transition_job(conn: &Connection, id: &str, from: &str, to: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE scheduled_job SET status = ?3 WHERE id = ?1 AND status = ?2",
        params![id, from, to],
    )?;
    Ok(changed > 0)
}

pub fn transition_all_jobs(conn: &Connection, from: &str, to: &str) -> Result<usize> {
    conn.execute(
        "UPDATE scheduled_job SET status = ?2 WHERE status = ?1",
        params![from, to],
    )
}

pub fn record_job_attempt(
    conn: &Connection,
    id: &str,
    status: &str,
    run_at: &str,
    last_error: Option<&str>,
    finished_at: Option<&str>,
) -> Result<()> {
    conn.execute(
        r#"
UPDATE scheduled_job
SET status = ?2,
    run_at = ?3,
    attempts = attempts + 1,
    last_error = ?4,
    finished_at = ?5
WHERE id = ?1
"#,
        params![id, status, run_at, last_error, finished_at],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub job_id: String,
    pub task_id: i64,
    pub done_time: String,
}

pub const DRAIN_STAGED: &str = "staged";
pub const DRAIN_COMMITTED: &str = "committed";

/// Replaces whatever an earlier attempt staged for `job_id`. Refuses to touch
/// a drain that already committed.
pub fn stage_snapshot(
    conn: &mut Connection,
    job_id: &str,
    rows: &[SnapshotRecord],
    drained: usize,
    staged_at: &str,
) -> Result<bool> {
    let tx = conn.transaction()?;
    if drain_state(&tx, job_id)?.as_deref() == Some(DRAIN_COMMITTED) {
        return Ok(false);
    }
    tx.execute(
        "DELETE FROM archival_snapshot WHERE job_id = ?1",
        params![job_id],
    )?;
    for row in rows {
        tx.execute(
            r#"
INSERT OR IGNORE INTO archival_snapshot (job_id, task_id, done_time, captured_at)
VALUES (?1, ?2, ?3, ?4)
"#,
            params![job_id, row.task_id, row.done_time, staged_at],
        )?;
    }
    tx.execute(
        r#"
INSERT INTO archival_drain (job_id, state, drained, staged_at, committed_at)
VALUES (?1, ?2, ?3, ?4, NULL)
ON CONFLICT(job_id) DO UPDATE SET
    state = excluded.state,
    drained = excluded.drained,
    staged_at = excluded.staged_at,
    committed_at = NULL
"#,
        params![job_id, DRAIN_STAGED, drained as i64, staged_at],
    )?;
    tx.commit()?;
    Ok(true)
}

pub fn commit_drain(conn: &Connection, job_id: &str, committed_at: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE archival_drain SET state = ?2, committed_at = ?3 WHERE job_id = ?1 AND state = ?4",
        params![job_id, DRAIN_COMMITTED, committed_at, DRAIN_STAGED],
    )?;
    Ok(changed == 1)
}

pub fn discard_staged_drain(conn: &mut Connection, job_id: &str) -> Result<bool> {
    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM archival_drain WHERE job_id = ?1 AND state = ?2",
        params![job_id, DRAIN_STAGED],
    )?;
    if removed == 1 {
        tx.execute(
            "DELETE FROM archival_snapshot WHERE job_id = ?1",
            params![job_id],
        )?;
    }
    tx.commit()?;
    Ok(removed == 1)
}

pub fn drain_state(conn: &Connection, job_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT state FROM archival_drain WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn list_staged_drains(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT job_id FROM archival_drain WHERE state = ?1 ORDER BY staged_at ASC, job_id ASC",
    )?;
    let mut rows = stmt.query(params![DRAIN_STAGED])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(row.get(0)?);
    }
    Ok(result)
}

/// Only rows whose drain committed in the volatile store are eligible.
pub fn list_unapplied_snapshots(conn: &Connection) -> Result<Vec<SnapshotRecord>> {
    let mut stmt = conn.prepare(
        r#"
SELECT s.job_id, s.task_id, s.done_time
FROM archival_snapshot s
JOIN archival_drain d ON d.job_id = s.job_id
WHERE s.applied_at IS NULL AND d.state = 'committed'
ORDER BY s.captured_at ASC, s.job_id ASC, s.task_id ASC
"#,
    )?;
    let mut rows = stmt.query([])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(SnapshotRecord {
            job_id: row.get(0)?,
            task_id: row.get(1)?,
            done_time: row.get(2)?,
        });
    }
    Ok(result)
}

pub fn mark_snapshot_applied(
    conn: &Connection,
    job_id: &str,
    task_id: i64,
    applied_at: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE archival_snapshot SET applied_at = ?3 WHERE job_id = ?1 AND task_id = ?2",
        params![job_id, task_id, applied_at],
    )?;
    Ok(())
}
