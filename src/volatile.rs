use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;
use std::num::NonZeroU32;

#[cfg(test)]
mod memory;
mod sqlite;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const DONE_TIME_FIELD: &str = "done_time";

/// Fixed key vocabulary shared by every component that touches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim();
        let prefix = if trimmed.is_empty() { "todo" } else { trimmed };
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn current_set(&self) -> String {
        format!("{}:current", self.prefix)
    }

    pub fn done_set(&self) -> String {
        format!("{}:done", self.prefix)
    }

    /// Accepts a numeric id or a raw set member.
    pub fn task_record(&self, task_id: impl fmt::Display) -> String {
        format!("{}#{}", self.prefix, task_id)
    }

    pub fn pending_archival_job(&self) -> String {
        format!("{}:archive_job_id", self.prefix)
    }

    /// When the marker was reserved, written in the same commit as the marker.
    pub fn pending_archival_reserved_at(&self) -> String {
        format!("{}:archive_job_reserved_at", self.prefix)
    }

    /// Written by a drain's commit; proves the volatile side of `job_id` landed.
    pub fn drain_receipt(&self, job_id: &str) -> String {
        format!("{}:archive_drained:{}", self.prefix, job_id)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("todo")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    AddToSet { set: String, member: String },
    RemoveFromSet { set: String, member: String },
    SetField { key: String, field: String, value: String },
    DeleteFields { key: String },
    SetValue { key: String, value: String },
    DeleteValue { key: String },
}

/// Buffered writes plus the key versions observed when each key was watched.
#[derive(Debug, Default)]
pub struct Transaction {
    watched: BTreeMap<String, u64>,
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub(crate) fn with_watched(watched: BTreeMap<String, u64>) -> Self {
        Self {
            watched,
            ops: Vec::new(),
        }
    }

    pub(crate) fn watched(&self) -> &BTreeMap<String, u64> {
        &self.watched
    }

    /// Keeps the first observed version when a key is watched twice.
    pub(crate) fn record_watch(&mut self, key: String, version: u64) {
        self.watched.entry(key).or_insert(version);
    }

    pub(crate) fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn is_watching(&self, key: &str) -> bool {
        self.watched.contains_key(key)
    }

    pub fn add_to_set(&mut self, set: &str, member: &str) -> &mut Self {
        self.ops.push(WriteOp::AddToSet {
            set: set.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn remove_from_set(&mut self, set: &str, member: &str) -> &mut Self {
        self.ops.push(WriteOp::RemoveFromSet {
            set: set.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn set_field(&mut self, key: &str, field: &str, value: &str) -> &mut Self {
        self.ops.push(WriteOp::SetField {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn delete_fields(&mut self, key: &str) -> &mut Self {
        self.ops.push(WriteOp::DeleteFields {
            key: key.to_string(),
        });
        self
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> &mut Self {
        self.ops.push(WriteOp::SetValue {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn delete_value(&mut self, key: &str) -> &mut Self {
        self.ops.push(WriteOp::DeleteValue {
            key: key.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Conflict,
}

/// Shared set/record store with a watch-and-commit optimistic lock.
///
/// Every mutation that changes a key bumps that key's version. A transaction
/// remembers the version of each watched key and `commit` applies its writes
/// only if none of them moved; otherwise it reports `Conflict` and applies
/// nothing.
pub trait VolatileStore: Send + Sync {
    fn add_to_set(&self, set: &str, member: &str) -> Result<bool, StoreError>;
    fn remove_from_set(&self, set: &str, member: &str) -> Result<bool, StoreError>;
    fn set_contains(&self, set: &str, member: &str) -> Result<bool, StoreError>;
    fn set_members(&self, set: &str) -> Result<BTreeSet<String>, StoreError>;

    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    fn delete_fields(&self, key: &str) -> Result<(), StoreError>;

    fn get_value(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn begin_optimistic(&self, watch_keys: &[String]) -> Result<Transaction, StoreError>;
    fn watch(&self, tx: &mut Transaction, keys: &[String]) -> Result<(), StoreError>;
    fn commit(&self, tx: Transaction) -> Result<CommitOutcome, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Unbounded,
    AtMost(NonZeroU32),
}

impl RetryLimit {
    fn allows(self, attempt: u32) -> bool {
        match self {
            RetryLimit::Unbounded => true,
            RetryLimit::AtMost(max) => attempt <= max.get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locked<R> {
    pub value: R,
    pub attempts: u32,
}

/// Runs read-then-write cycles until one commits without a watched key moving.
///
/// `read` may extend the watch through `VolatileStore::watch`. `write` only
/// buffers into the transaction; side effects belong after this returns.
pub fn run_with_optimistic_lock<S, R, E, F, G>(
    store: &S,
    watch_keys: &[String],
    limit: RetryLimit,
    mut read: F,
    mut write: G,
) -> Result<Locked<R>, E>
where
    S: VolatileStore + ?Sized,
    E: From<StoreError>,
    F: FnMut(&mut Transaction) -> Result<R, E>,
    G: FnMut(&R, &mut Transaction) -> Result<(), E>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if !limit.allows(attempt) {
            return Err(StoreError::RetriesExhausted(attempt - 1).into());
        }

        let mut tx = store.begin_optimistic(watch_keys)?;
        let value = read(&mut tx)?;
        write(&value, &mut tx)?;
        match store.commit(tx)? {
            CommitOutcome::Committed => {
                return Ok(Locked {
                    value,
                    attempts: attempt,
                })
            }
            CommitOutcome::Conflict => {
                tracing::debug!(attempt, "optimistic commit conflicted; retrying");
            }
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Db(rusqlite::Error),
    RetriesExhausted(u32),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Db(err) => write!(f, "volatile store error: {}", err),
            StoreError::RetriesExhausted(attempts) => write!(
                f,
                "optimistic transaction still conflicting after {} attempt(s)",
                attempts
            ),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Db(err) => Some(err),
            StoreError::RetriesExhausted(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        StoreError::Db(value)
    }
}
