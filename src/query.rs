use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::db::{self, Database, HistoryRecord};
use crate::domain::task::Task;
use crate::errors::TrackerError;
use crate::volatile::{Keyspace, VolatileStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskScope {
    Current,
    Later,
    Done,
    #[default]
    All,
}

impl TaskScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskScope::Current => "current",
            TaskScope::Later => "later",
            TaskScope::Done => "done",
            TaskScope::All => "all",
        }
    }
}

impl fmt::Display for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "current" | "now" => Ok(TaskScope::Current),
            "later" => Ok(TaskScope::Later),
            "done" => Ok(TaskScope::Done),
            "all" => Ok(TaskScope::All),
            other => Err(format!(
                "unknown scope '{}', expected current, later, done or all",
                other
            )),
        }
    }
}

/// Set-level views joining volatile membership with durable task rows.
/// Every list is ordered by task id.
pub struct TaskQueries {
    db: Arc<Database>,
    store: Arc<dyn VolatileStore>,
    keys: Keyspace,
}

impl TaskQueries {
    pub fn new(db: Arc<Database>, store: Arc<dyn VolatileStore>, keys: Keyspace) -> Self {
        Self { db, store, keys }
    }

    pub fn get(&self, id: i64) -> Result<Task, TrackerError> {
        let conn = self.db.conn();
        db::get_task(&conn, id)?
            .map(Task::from)
            .ok_or(TrackerError::TaskNotFound(id))
    }

    pub fn list(&self, scope: TaskScope) -> Result<Vec<Task>, TrackerError> {
        match scope {
            TaskScope::Current => self.current(),
            TaskScope::Later => self.later(),
            TaskScope::Done => self.done(),
            TaskScope::All => self.all(),
        }
    }

    pub fn current(&self) -> Result<Vec<Task>, TrackerError> {
        let ids = self.member_ids(&self.keys.current_set())?;
        let conn = self.db.conn();
        Ok(into_tasks(db::list_tasks_by_ids(&conn, &ids)?))
    }

    /// Everything not in the current set, archived reminders included.
    pub fn later(&self) -> Result<Vec<Task>, TrackerError> {
        let ids = self.member_ids(&self.keys.current_set())?;
        let conn = self.db.conn();
        Ok(into_tasks(db::list_tasks_excluding(&conn, &ids)?))
    }

    pub fn done(&self) -> Result<Vec<Task>, TrackerError> {
        let ids = self.member_ids(&self.keys.done_set())?;
        let conn = self.db.conn();
        let mut tasks = into_tasks(db::list_tasks_by_ids(&conn, &ids)?);
        let seen = ids.iter().copied().collect::<BTreeSet<_>>();
        tasks.extend(
            db::list_archived_reminders(&conn)?
                .into_iter()
                .filter(|record| !seen.contains(&record.id))
                .map(Task::from),
        );
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    pub fn all(&self) -> Result<Vec<Task>, TrackerError> {
        let conn = self.db.conn();
        Ok(into_tasks(db::list_tasks(&conn)?))
    }

    /// Newest first.
    pub fn history(&self, task_id: i64) -> Result<Vec<HistoryRecord>, TrackerError> {
        let conn = self.db.conn();
        if db::get_task(&conn, task_id)?.is_none() {
            return Err(TrackerError::TaskNotFound(task_id));
        }
        Ok(db::list_history(&conn, task_id)?)
    }

    /// Removes the task row, its history and any volatile traces.
    pub fn delete_task(&self, id: i64) -> Result<(), TrackerError> {
        let deleted = {
            let conn = self.db.conn();
            db::delete_task(&conn, id)?
        };
        if !deleted {
            return Err(TrackerError::TaskNotFound(id));
        }
        let member = id.to_string();
        self.store.remove_from_set(&self.keys.current_set(), &member)?;
        self.store.remove_from_set(&self.keys.done_set(), &member)?;
        self.store.delete_fields(&self.keys.task_record(id))?;
        tracing::info!(task_id = id, "deleted task");
        Ok(())
    }

    fn member_ids(&self, set: &str) -> Result<Vec<i64>, TrackerError> {
        let mut ids = Vec::new();
        for member in self.store.set_members(set)? {
            match member.parse::<i64>() {
                Ok(id) => ids.push(id),
                Err(_) => tracing::warn!(set, member = %member, "skipping malformed set member"),
            }
        }
        Ok(ids)
    }
}

fn into_tasks(records: Vec<db::TaskRecord>) -> Vec<Task> {
    records.into_iter().map(Task::from).collect()
}
