use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};

use super::{CommitOutcome, StoreError, Transaction, VolatileStore, WriteOp};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS key_version (
    key TEXT PRIMARY KEY,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS set_member (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);

CREATE TABLE IF NOT EXISTS record_field (
    key TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);

CREATE TABLE IF NOT EXISTS singleton (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Volatile store kept in its own SQLite file so that every process pointed
/// at the same path shares one state. Key versions survive deletes, which
/// keeps watches honest across delete-then-recreate.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None::<DatabaseName>, "journal_mode", "WAL")?;
        conn.pragma_update(None::<DatabaseName>, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_one(&self, op: &WriteOp) -> Result<bool, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = apply_op(&tx, op)?;
        tx.commit()?;
        Ok(changed)
    }
}

fn version(conn: &Connection, key: &str) -> rusqlite::Result<u64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM key_version WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0).max(0) as u64)
}

fn touch(conn: &Connection, key: &str) -> rusqlite::Result<()> {
    conn.execute(
        r#"
INSERT INTO key_version (key, version)
VALUES (?1, 1)
ON CONFLICT(key) DO UPDATE SET version = version + 1
"#,
        params![key],
    )?;
    Ok(())
}

fn apply_op(conn: &Connection, op: &WriteOp) -> rusqlite::Result<bool> {
    let (key, changed) = match op {
        WriteOp::AddToSet { set, member } => {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO set_member (key, member) VALUES (?1, ?2)",
                params![set, member],
            )?;
            (set, inserted > 0)
        }
        WriteOp::RemoveFromSet { set, member } => {
            let removed = conn.execute(
                "DELETE FROM set_member WHERE key = ?1 AND member = ?2",
                params![set, member],
            )?;
            (set, removed > 0)
        }
        WriteOp::SetField { key, field, value } => {
            conn.execute(
                r#"
INSERT INTO record_field (key, field, value)
VALUES (?1, ?2, ?3)
ON CONFLICT(key, field) DO UPDATE SET value = excluded.value
"#,
                params![key, field, value],
            )?;
            (key, true)
        }
        WriteOp::DeleteFields { key } => {
            let removed = conn.execute("DELETE FROM record_field WHERE key = ?1", params![key])?;
            (key, removed > 0)
        }
        WriteOp::SetValue { key, value } => {
            conn.execute(
                r#"
INSERT INTO singleton (key, value)
VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
                params![key, value],
            )?;
            (key, true)
        }
        WriteOp::DeleteValue { key } => {
            let removed = conn.execute("DELETE FROM singleton WHERE key = ?1", params![key])?;
            (key, removed > 0)
        }
    };
    if changed {
        touch(conn, key)?;
    }
    Ok(changed)
}

impl VolatileStore for SqliteStore {
    fn add_to_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        self.apply_one(&WriteOp::AddToSet {
            set: set.to_string(),
            member: member.to_string(),
        })
    }

    fn remove_from_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        self.apply_one(&WriteOp::RemoveFromSet {
            set: set.to_string(),
            member: member.to_string(),
        })
    }

    fn set_contains(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM set_member WHERE key = ?1 AND member = ?2)",
            params![set, member],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn set_members(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT member FROM set_member WHERE key = ?1")?;
        let mut rows = stmt.query(params![set])?;
        let mut members = BTreeSet::new();
        while let Some(row) = rows.next()? {
            members.insert(row.get(0)?);
        }
        Ok(members)
    }

    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.apply_one(&WriteOp::SetField {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM record_field WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn delete_fields(&self, key: &str) -> Result<(), StoreError> {
        self.apply_one(&WriteOp::DeleteFields {
            key: key.to_string(),
        })?;
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM singleton WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn begin_optimistic(&self, watch_keys: &[String]) -> Result<Transaction, StoreError> {
        let conn = self.lock();
        let mut watched = std::collections::BTreeMap::new();
        for key in watch_keys {
            watched.insert(key.clone(), version(&conn, key)?);
        }
        Ok(Transaction::with_watched(watched))
    }

    fn watch(&self, tx: &mut Transaction, keys: &[String]) -> Result<(), StoreError> {
        let conn = self.lock();
        for key in keys {
            if !tx.is_watching(key) {
                tx.record_watch(key.clone(), version(&conn, key)?);
            }
        }
        Ok(())
    }

    fn commit(&self, tx: Transaction) -> Result<CommitOutcome, StoreError> {
        let mut conn = self.lock();
        let db_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (key, expected) in tx.watched() {
            if version(&db_tx, key)? != *expected {
                db_tx.rollback()?;
                return Ok(CommitOutcome::Conflict);
            }
        }
        for op in tx.into_ops() {
            apply_op(&db_tx, &op)?;
        }
        db_tx.commit()?;
        Ok(CommitOutcome::Committed)
    }
}
