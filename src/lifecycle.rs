use std::sync::Arc;

use time::OffsetDateTime;

use crate::clock::{format_instant, parse_instant, Clock};
use crate::db::{self, Database};
use crate::domain::state::LifecycleState;
use crate::domain::task::Task;
use crate::domain::task_kind::TaskKind;
use crate::errors::TrackerError;
use crate::scheduler::ArchivalScheduler;
use crate::volatile::{
    run_with_optimistic_lock, Keyspace, RetryLimit, VolatileStore, DONE_TIME_FIELD,
};

/// Per-task current/done transitions. Volatile membership covers the current
/// cycle; durable history covers what archival already recorded.
pub struct TaskLifecycle {
    db: Arc<Database>,
    store: Arc<dyn VolatileStore>,
    keys: Keyspace,
    scheduler: Arc<ArchivalScheduler>,
    clock: Arc<dyn Clock>,
}

impl TaskLifecycle {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn VolatileStore>,
        keys: Keyspace,
        scheduler: Arc<ArchivalScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            store,
            keys,
            scheduler,
            clock,
        }
    }

    /// Only reminders archive; a routine starts over every cycle.
    pub fn is_archived(&self, task: &Task) -> Result<bool, TrackerError> {
        match task.kind {
            TaskKind::Reminder => {
                let conn = self.db.conn();
                Ok(db::history_count(&conn, task.id)? > 0)
            }
            TaskKind::Routine => Ok(false),
        }
    }

    pub fn set_current(&self, task: &Task, flag: bool) -> Result<(), TrackerError> {
        if self.is_archived(task)? {
            tracing::debug!(task_id = task.id, flag, "ignoring current toggle on archived reminder");
            return Ok(());
        }
        let member = task.id.to_string();
        if flag {
            self.store.add_to_set(&self.keys.current_set(), &member)?;
        } else {
            self.store.remove_from_set(&self.keys.current_set(), &member)?;
        }
        Ok(())
    }

    pub fn set_done(&self, task: &Task, flag: bool) -> Result<(), TrackerError> {
        match task.kind {
            TaskKind::Reminder if self.is_archived(task)? => {
                if !flag {
                    self.reverse_archival(task)?;
                }
                Ok(())
            }
            TaskKind::Reminder | TaskKind::Routine => self.set_cycle_done(task, flag),
        }
    }

    /// The writes for one transition commit together, so an archival drain
    /// sees either none or all of them and `done` stays inside `current`.
    fn set_cycle_done(&self, task: &Task, flag: bool) -> Result<(), TrackerError> {
        let member = task.id.to_string();
        let record = self.keys.task_record(task.id);
        let current = self.keys.current_set();
        let done = self.keys.done_set();
        let done_time = format_instant(self.clock.now_utc());

        run_with_optimistic_lock(
            self.store.as_ref(),
            &[],
            RetryLimit::Unbounded,
            |_tx| Ok::<_, TrackerError>(()),
            |_, tx| {
                if flag {
                    tx.add_to_set(&current, &member)
                        .set_field(&record, DONE_TIME_FIELD, &done_time)
                        .add_to_set(&done, &member);
                } else {
                    tx.remove_from_set(&done, &member).delete_fields(&record);
                }
                Ok(())
            },
        )?;

        if flag {
            tracing::debug!(task_id = task.id, kind = %task.kind, "marked done");
            self.scheduler.ensure_scheduled()?;
        } else {
            tracing::debug!(task_id = task.id, kind = %task.kind, "cleared done");
            self.scheduler.release_if_idle()?;
        }
        Ok(())
    }

    fn reverse_archival(&self, task: &Task) -> Result<(), TrackerError> {
        let removed = {
            let conn = self.db.conn();
            db::delete_sole_history(&conn, task.id)?
        };
        if removed {
            tracing::info!(task_id = task.id, "reverted archived reminder to later");
        }
        Ok(())
    }

    pub fn is_done(&self, task: &Task) -> Result<bool, TrackerError> {
        if self
            .store
            .set_contains(&self.keys.done_set(), &task.id.to_string())?
        {
            return Ok(true);
        }
        self.is_archived(task)
    }

    pub fn is_current(&self, task: &Task) -> Result<bool, TrackerError> {
        Ok(self
            .store
            .set_contains(&self.keys.current_set(), &task.id.to_string())?)
    }

    pub fn done_time(&self, task: &Task) -> Result<Option<OffsetDateTime>, TrackerError> {
        let raw = if self.is_archived(task)? {
            let conn = self.db.conn();
            db::latest_done_time(&conn, task.id)?
        } else {
            self.store
                .get_field(&self.keys.task_record(task.id), DONE_TIME_FIELD)?
        };
        raw.map(|value| parse_instant(&value).map_err(|_| TrackerError::InvalidTimestamp(value)))
            .transpose()
    }

    pub fn state(&self, task: &Task) -> Result<LifecycleState, TrackerError> {
        let archived = self.is_archived(task)?;
        let member = task.id.to_string();
        let current = self.store.set_contains(&self.keys.current_set(), &member)?;
        let done = self.store.set_contains(&self.keys.done_set(), &member)?;
        Ok(LifecycleState::derive(task.kind, archived, current, done))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use time::macros::datetime;
    use time::Duration;

    use crate::domain::state::LifecycleState;
    use crate::testing::Harness;
    use crate::volatile::{
        CommitOutcome, MemoryStore, StoreError, Transaction, VolatileStore, DONE_TIME_FIELD,
    };

    /// Counts writes that bypass a transaction.
    #[derive(Default)]
    struct DirectWriteCounter {
        inner: MemoryStore,
        direct_writes: AtomicUsize,
    }

    impl DirectWriteCounter {
        fn bump(&self) {
            self.direct_writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl VolatileStore for DirectWriteCounter {
        fn add_to_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
            self.bump();
            self.inner.add_to_set(set, member)
        }

        fn remove_from_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
            self.bump();
            self.inner.remove_from_set(set, member)
        }

        fn set_contains(&self, set: &str, member: &str) -> Result<bool, StoreError> {
            self.inner.set_contains(set, member)
        }

        fn set_members(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
            self.inner.set_members(set)
        }

        fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.bump();
            self.inner.set_field(key, field, value)
        }

        fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
            self.inner.get_field(key, field)
        }

        fn delete_fields(&self, key: &str) -> Result<(), StoreError> {
            self.bump();
            self.inner.delete_fields(key)
        }

        fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get_value(key)
        }

        fn begin_optimistic(&self, watch_keys: &[String]) -> Result<Transaction, StoreError> {
            self.inner.begin_optimistic(watch_keys)
        }

        fn watch(&self, tx: &mut Transaction, keys: &[String]) -> Result<(), StoreError> {
            self.inner.watch(tx, keys)
        }

        fn commit(&self, tx: Transaction) -> Result<CommitOutcome, StoreError> {
            self.inner.commit(tx)
        }
    }

    #[test]
    fn done_transitions_commit_as_one_write() {
        let store = Arc::new(DirectWriteCounter::default());
        let harness = Harness::with_store("lifecycle-atomic", store.clone());
        let task = harness.reminder("Pay rent");

        harness.lifecycle.set_done(&task, true).expect("done");
        assert_eq!(store.direct_writes.load(Ordering::SeqCst), 0);
        assert!(harness.lifecycle.is_current(&task).expect("is_current"));
        assert!(harness.lifecycle.is_done(&task).expect("is_done"));

        harness.lifecycle.set_done(&task, false).expect("undo");
        assert_eq!(store.direct_writes.load(Ordering::SeqCst), 0);
        assert!(!harness.lifecycle.is_done(&task).expect("is_done"));
        assert_eq!(harness.lifecycle.done_time(&task).expect("done_time"), None);
    }

    #[test]
    fn done_implies_current_and_stamps_time() {
        let harness = Harness::new("lifecycle-done");
        let task = harness.reminder("Pay rent");

        harness.lifecycle.set_done(&task, true).expect("done");

        assert!(harness.lifecycle.is_done(&task).expect("is_done"));
        assert!(harness.lifecycle.is_current(&task).expect("is_current"));
        assert_eq!(
            harness.lifecycle.done_time(&task).expect("done_time"),
            Some(datetime!(2026-10-16 12:00 UTC))
        );
        assert_eq!(
            harness.lifecycle.state(&task).expect("state"),
            LifecycleState::Done
        );
        assert!(harness.scheduler.pending().expect("pending").is_some());
    }

    #[test]
    fn undone_keeps_current_and_clears_time() {
        let harness = Harness::new("lifecycle-undo");
        let task = harness.reminder("Pay rent");

        harness.lifecycle.set_done(&task, true).expect("done");
        harness.lifecycle.set_done(&task, false).expect("undo");

        assert!(!harness.lifecycle.is_done(&task).expect("is_done"));
        assert!(harness.lifecycle.is_current(&task).expect("is_current"));
        assert_eq!(harness.lifecycle.done_time(&task).expect("done_time"), None);
        assert_eq!(
            harness
                .store
                .get_field(&harness.keys.task_record(task.id), DONE_TIME_FIELD)
                .expect("field"),
            None
        );
        // nothing left to archive, so the pending job is released
        assert!(harness.scheduler.pending().expect("pending").is_none());
    }

    #[test]
    fn redoing_a_task_refreshes_done_time() {
        let harness = Harness::new("lifecycle-redo");
        let task = harness.routine("Stretch");

        harness.lifecycle.set_done(&task, true).expect("done");
        harness.clock.advance(Duration::hours(2));
        harness.lifecycle.set_done(&task, true).expect("done again");

        assert_eq!(
            harness.lifecycle.done_time(&task).expect("done_time"),
            Some(datetime!(2026-10-16 14:00 UTC))
        );
        assert_eq!(harness.jobs().len(), 1);
    }

    #[test]
    fn current_toggle_and_state_derivation() {
        let harness = Harness::new("lifecycle-current");
        let task = harness.reminder("Call mom");
        assert_eq!(
            harness.lifecycle.state(&task).expect("state"),
            LifecycleState::Later
        );

        harness.lifecycle.set_current(&task, true).expect("current");
        assert_eq!(
            harness.lifecycle.state(&task).expect("state"),
            LifecycleState::Current
        );
        assert!(!harness.lifecycle.is_done(&task).expect("is_done"));

        harness.lifecycle.set_current(&task, false).expect("later");
        harness.lifecycle.set_current(&task, false).expect("idempotent");
        assert!(!harness.lifecycle.is_current(&task).expect("is_current"));
    }

    #[test]
    fn archived_reminder_ignores_toggles_until_reversed() {
        let harness = Harness::new("lifecycle-archived");
        let task = harness.reminder("Pay rent");
        harness.lifecycle.set_done(&task, true).expect("done");
        harness.archive_now();

        assert!(harness.lifecycle.is_archived(&task).expect("archived"));
        assert!(harness.lifecycle.is_done(&task).expect("is_done"));
        assert!(!harness.lifecycle.is_current(&task).expect("is_current"));
        assert_eq!(
            harness.lifecycle.done_time(&task).expect("done_time"),
            Some(datetime!(2026-10-16 12:00 UTC))
        );
        assert_eq!(
            harness.lifecycle.state(&task).expect("state"),
            LifecycleState::Archived
        );

        harness.lifecycle.set_current(&task, true).expect("ignored");
        harness.lifecycle.set_done(&task, true).expect("ignored");
        assert!(!harness.lifecycle.is_current(&task).expect("is_current"));
        assert!(harness.scheduler.pending().expect("pending").is_none());

        harness.lifecycle.set_done(&task, false).expect("reverse");
        assert!(!harness.lifecycle.is_archived(&task).expect("archived"));
        assert!(!harness.lifecycle.is_done(&task).expect("is_done"));
        assert!(!harness.lifecycle.is_current(&task).expect("is_current"));
        assert_eq!(
            harness.lifecycle.state(&task).expect("state"),
            LifecycleState::Later
        );
    }

    #[test]
    fn routine_is_never_archived() {
        let harness = Harness::new("lifecycle-routine");
        let task = harness.routine("Stretch");
        harness.lifecycle.set_done(&task, true).expect("done");
        harness.archive_now();

        assert!(!harness.lifecycle.is_archived(&task).expect("archived"));
        assert!(!harness.lifecycle.is_done(&task).expect("is_done"));
        assert_eq!(harness.lifecycle.done_time(&task).expect("done_time"), None);
        assert_eq!(harness.history(task.id).len(), 1);

        harness.lifecycle.set_done(&task, false).expect("undo is a no-op");
        assert_eq!(harness.history(task.id).len(), 1);
    }
}
