use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;

use crate::clock::{format_instant, parse_instant, Clock};
use crate::db::{self, Database, SnapshotRecord};
use crate::domain::task_kind::TaskKind;
use crate::errors::TrackerError;
use crate::volatile::{
    run_with_optimistic_lock, Keyspace, Locked, RetryLimit, VolatileStore, DONE_TIME_FIELD,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub job_id: String,
    /// Optimistic attempts spent draining the done set.
    pub attempts: u32,
    pub drained: usize,
    pub reminders_archived: usize,
    pub routines_reset: usize,
    pub history_written: usize,
    /// Rows recovered from earlier runs that drained but never applied.
    pub replayed: usize,
    pub skipped_missing: usize,
}

#[derive(Debug, Clone)]
struct DrainedTask {
    member: String,
    record_key: String,
    done_time: Option<String>,
}

#[derive(Debug)]
struct Drained {
    tasks: Vec<DrainedTask>,
    rows: Vec<SnapshotRecord>,
}

#[derive(Debug, Default)]
struct AppliedCounts {
    reminders_archived: usize,
    routines_reset: usize,
    history_written: usize,
    skipped_missing: usize,
}

impl AppliedCounts {
    fn add_to(&self, summary: &mut ArchiveSummary) {
        summary.reminders_archived += self.reminders_archived;
        summary.routines_reset += self.routines_reset;
        summary.history_written += self.history_written;
        summary.skipped_missing += self.skipped_missing;
    }
}

/// Moves the done set into durable history.
///
/// The drain is a single optimistic transaction over the done set and every
/// drained task's record, so a concurrent un-complete or re-complete either
/// lands before the snapshot or forces a retry.
///
/// Each attempt stages its snapshot in `archival_snapshot` before committing
/// to the volatile store, and the commit leaves a receipt key behind. A staged
/// drain with a receipt is promoted and applied by the next run; one without
/// a receipt never touched the volatile store and is discarded.
pub struct ArchivalJob {
    db: Arc<Database>,
    store: Arc<dyn VolatileStore>,
    keys: Keyspace,
    clock: Arc<dyn Clock>,
}

impl ArchivalJob {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn VolatileStore>,
        keys: Keyspace,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            store,
            keys,
            clock,
        }
    }

    pub fn run(&self, job_id: &str) -> Result<ArchiveSummary, TrackerError> {
        let mut summary = ArchiveSummary {
            job_id: job_id.to_string(),
            ..ArchiveSummary::default()
        };

        self.settle_staged(job_id)?;
        let already_drained = {
            let conn = self.db.conn();
            db::drain_state(&conn, job_id)?.as_deref() == Some(db::DRAIN_COMMITTED)
        };
        self.replay_unapplied(&mut summary)?;
        if already_drained {
            tracing::info!(job_id, replayed = summary.replayed, "archival job re-run; replay only");
            return Ok(summary);
        }

        let locked = self.drain(job_id)?;
        summary.attempts = locked.attempts;
        summary.drained = locked.value.tasks.len();
        self.promote(job_id)?;

        let counts = {
            let mut conn = self.db.conn();
            self.apply(&mut conn, &locked.value.rows)?
        };
        counts.add_to(&mut summary);

        tracing::info!(
            job_id,
            attempts = summary.attempts,
            drained = summary.drained,
            reminders = summary.reminders_archived,
            routines = summary.routines_reset,
            history = summary.history_written,
            "archived done tasks"
        );
        Ok(summary)
    }

    fn drain(&self, job_id: &str) -> Result<Locked<Drained>, TrackerError> {
        let done = self.keys.done_set();
        let current = self.keys.current_set();
        let marker = self.keys.pending_archival_job();
        let reserved_at = self.keys.pending_archival_reserved_at();
        let receipt = self.keys.drain_receipt(job_id);

        run_with_optimistic_lock(
            self.store.as_ref(),
            std::slice::from_ref(&done),
            RetryLimit::Unbounded,
            |tx| {
                let members = self.store.set_members(&done)?;
                let record_keys = members
                    .iter()
                    .map(|member| self.keys.task_record(member))
                    .collect::<Vec<_>>();
                // watched before read, so a re-stamp between here and commit conflicts
                self.store.watch(tx, &record_keys)?;

                let mut tasks = Vec::with_capacity(members.len());
                for (member, record_key) in members.into_iter().zip(record_keys) {
                    let done_time = self.store.get_field(&record_key, DONE_TIME_FIELD)?;
                    tasks.push(DrainedTask {
                        member,
                        record_key,
                        done_time,
                    });
                }

                let rows = self.snapshot_rows(job_id, &tasks);
                let staged = {
                    let mut conn = self.db.conn();
                    db::stage_snapshot(
                        &mut conn,
                        job_id,
                        &rows,
                        tasks.len(),
                        &format_instant(self.clock.now_utc()),
                    )?
                };
                if !staged {
                    return Err(TrackerError::DrainAlreadyCommitted(job_id.to_string()));
                }
                Ok::<_, TrackerError>(Drained { tasks, rows })
            },
            |drained, tx| {
                for task in &drained.tasks {
                    tx.remove_from_set(&current, &task.member)
                        .remove_from_set(&done, &task.member)
                        .delete_fields(&task.record_key);
                }
                tx.delete_value(&marker)
                    .delete_value(&reserved_at)
                    .set_value(&receipt, &format_instant(self.clock.now_utc()));
                Ok(())
            },
        )
    }

    /// Marks a staged drain committed and drops its receipt. Safe to repeat.
    fn promote(&self, job_id: &str) -> Result<(), TrackerError> {
        {
            let conn = self.db.conn();
            db::commit_drain(&conn, job_id, &format_instant(self.clock.now_utc()))?;
        }
        let receipt = self.keys.drain_receipt(job_id);
        run_with_optimistic_lock(
            self.store.as_ref(),
            &[],
            RetryLimit::Unbounded,
            |_tx| Ok::<_, TrackerError>(()),
            |_, tx| {
                tx.delete_value(&receipt);
                Ok(())
            },
        )?;
        Ok(())
    }

    /// Resolves drains an earlier run staged but never recorded as committed.
    /// Drains of other jobs without a receipt may still be in flight and are
    /// left alone.
    fn settle_staged(&self, job_id: &str) -> Result<(), TrackerError> {
        let staged = {
            let conn = self.db.conn();
            db::list_staged_drains(&conn)?
        };
        for staged_job in staged {
            let receipt = self.store.get_value(&self.keys.drain_receipt(&staged_job))?;
            if receipt.is_some() {
                tracing::warn!(job_id = %staged_job, "recovering archival drain that committed unrecorded");
                self.promote(&staged_job)?;
            } else if staged_job == job_id {
                let mut conn = self.db.conn();
                if db::discard_staged_drain(&mut conn, job_id)? {
                    tracing::debug!(job_id, "discarded snapshot of a drain that never committed");
                }
            }
        }
        Ok(())
    }

    fn snapshot_rows(&self, job_id: &str, drained: &[DrainedTask]) -> Vec<SnapshotRecord> {
        let now = self.clock.now_utc();
        let mut rows = Vec::with_capacity(drained.len());
        for task in drained {
            let Ok(task_id) = task.member.parse::<i64>() else {
                tracing::warn!(job_id, member = %task.member, "dropping malformed done member");
                continue;
            };
            let done_time = match task.done_time.as_deref().map(parse_instant) {
                Some(Ok(instant)) => format_instant(instant),
                Some(Err(_)) | None => {
                    tracing::warn!(
                        job_id,
                        task_id,
                        raw = ?task.done_time,
                        "done task had no usable done_time; using archival time"
                    );
                    format_instant(now)
                }
            };
            rows.push(SnapshotRecord {
                job_id: job_id.to_string(),
                task_id,
                done_time,
            });
        }
        rows
    }

    fn replay_unapplied(&self, summary: &mut ArchiveSummary) -> Result<(), TrackerError> {
        let mut conn = self.db.conn();
        let rows = db::list_unapplied_snapshots(&conn)?;
        if rows.is_empty() {
            return Ok(());
        }
        tracing::warn!(rows = rows.len(), "replaying unapplied archival snapshots");
        let counts = self.apply(&mut conn, &rows)?;
        summary.replayed += rows.len();
        counts.add_to(summary);
        Ok(())
    }

    fn apply(
        &self,
        conn: &mut Connection,
        rows: &[SnapshotRecord],
    ) -> Result<AppliedCounts, TrackerError> {
        let applied_at = format_instant(self.clock.now_utc());
        let mut counts = AppliedCounts::default();
        let tx = conn.transaction()?;
        for row in rows {
            let kind =
                db::get_task(&tx, row.task_id)?.map(|task| TaskKind::from_routine_flag(task.is_routine));
            match kind {
                None => {
                    tracing::debug!(task_id = row.task_id, "archived task no longer exists");
                    counts.skipped_missing += 1;
                }
                Some(TaskKind::Reminder) => {
                    // a reminder is archived exactly once
                    if db::history_count(&tx, row.task_id)? == 0
                        && db::append_history(&tx, row.task_id, &row.done_time)?
                    {
                        counts.history_written += 1;
                    }
                    counts.reminders_archived += 1;
                }
                Some(TaskKind::Routine) => {
                    if db::append_history(&tx, row.task_id, &row.done_time)? {
                        counts.history_written += 1;
                    }
                    counts.routines_reset += 1;
                }
            }
            db::mark_snapshot_applied(&tx, &row.job_id, row.task_id, &applied_at)?;
        }
        tx.commit()?;
        Ok(counts)
    }
}
