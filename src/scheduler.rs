use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::{format_instant, parse_instant, Clock};
use crate::errors::TrackerError;
use crate::jobs::{JobKind, JobQueue, JobRequest};
use crate::volatile::{run_with_optimistic_lock, Keyspace, RetryLimit, VolatileStore};

const MARKER_RELEASE_ATTEMPTS: NonZeroU32 = NonZeroU32::MIN.saturating_add(4);
const RESERVATION_GRACE: time::Duration = time::Duration::minutes(5);

/// Owns the single pending archival job: at most one marker in the volatile
/// store, pointing at a job queued for the next local midnight.
pub struct ArchivalScheduler {
    store: Arc<dyn VolatileStore>,
    keys: Keyspace,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    zone: Tz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingArchival {
    pub job_id: String,
    /// Absent when the marker points at a job the queue no longer holds.
    pub run_at: Option<String>,
}

impl ArchivalScheduler {
    pub fn new(
        store: Arc<dyn VolatileStore>,
        keys: Keyspace,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        zone: Tz,
    ) -> Self {
        Self {
            store,
            keys,
            queue,
            clock,
            zone,
        }
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    /// Queues an archival job for the next local midnight unless one is
    /// already pending. Returns the id of a newly queued job.
    pub fn ensure_scheduled(&self) -> Result<Option<String>, TrackerError> {
        let marker = self.keys.pending_archival_job();
        let reserved_at = self.keys.pending_archival_reserved_at();
        let now = self.clock.now_utc();
        let run_at = next_cutoff(now, self.zone)?;
        let request = JobRequest::new(JobKind::ArchiveDoneTasks, run_at);

        let locked = run_with_optimistic_lock(
            self.store.as_ref(),
            std::slice::from_ref(&marker),
            RetryLimit::Unbounded,
            |_tx| Ok::<_, TrackerError>(self.store.get_value(&marker)?),
            |existing, tx| {
                if existing.is_none() {
                    tx.set_value(&marker, &request.id)
                        .set_value(&reserved_at, &format_instant(now));
                }
                Ok(())
            },
        )?;
        if let Some(existing) = locked.value {
            tracing::debug!(job_id = %existing, "archival already scheduled");
            return Ok(None);
        }

        let job_id = request.id.clone();
        match self.queue.enqueue(request) {
            Ok(job_id) => {
                tracing::info!(
                    job_id = %job_id,
                    run_at = %format_instant(run_at),
                    zone = self.zone.name(),
                    "scheduled archival"
                );
                Ok(Some(job_id))
            }
            Err(err) => {
                if let Err(release_err) = self.clear_marker_if(&job_id) {
                    tracing::warn!(
                        job_id = %job_id,
                        error = %release_err,
                        "could not release archival marker after enqueue failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Drops the marker and cancels its job once nothing is waiting to be
    /// archived. Returns the id of the released job.
    pub fn release_if_idle(&self) -> Result<Option<String>, TrackerError> {
        let done = self.keys.done_set();
        let marker = self.keys.pending_archival_job();
        let reserved_at = self.keys.pending_archival_reserved_at();

        let locked = run_with_optimistic_lock(
            self.store.as_ref(),
            &[done.clone(), marker.clone()],
            RetryLimit::Unbounded,
            |_tx| {
                if !self.store.set_members(&done)?.is_empty() {
                    return Ok::<_, TrackerError>(None);
                }
                Ok(self.store.get_value(&marker)?)
            },
            |pending, tx| {
                if pending.is_some() {
                    tx.delete_value(&marker).delete_value(&reserved_at);
                }
                Ok(())
            },
        )?;

        let Some(job_id) = locked.value else {
            return Ok(None);
        };
        match self.queue.cancel(&job_id) {
            Ok(true) => tracing::info!(job_id = %job_id, "cancelled idle archival"),
            Ok(false) => tracing::debug!(job_id = %job_id, "archival job was no longer pending"),
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "failed to cancel archival job")
            }
        }
        Ok(Some(job_id))
    }

    /// Repairs a marker that names a finished job or one that was never
    /// queued, or a missing marker while tasks wait in the done set.
    ///
    /// A marker reserved less than `RESERVATION_GRACE` ago without a queued
    /// job is an `ensure_scheduled` between its two steps and is left alone.
    pub fn reconcile(&self) -> Result<Option<String>, TrackerError> {
        let marker = self.keys.pending_archival_job();
        if let Some(job_id) = self.store.get_value(&marker)? {
            match self.queue.status(&job_id)? {
                Some(status) if status.is_outstanding() => return Ok(None),
                Some(status) => {
                    tracing::warn!(
                        job_id = %job_id,
                        status = status.as_str(),
                        "archival marker points at a finished job"
                    );
                }
                None if self.reservation_is_fresh()? => {
                    tracing::debug!(job_id = %job_id, "archival job reserved but not queued yet");
                    return Ok(None);
                }
                None => {
                    tracing::warn!(job_id = %job_id, "archival marker points at a job never queued");
                }
            }
            self.clear_marker_if(&job_id)?;
        }

        if self.store.set_members(&self.keys.done_set())?.is_empty() {
            return Ok(None);
        }
        self.ensure_scheduled()
    }

    pub fn pending(&self) -> Result<Option<PendingArchival>, TrackerError> {
        let Some(job_id) = self
            .store
            .get_value(&self.keys.pending_archival_job())?
        else {
            return Ok(None);
        };
        let run_at = self.queue.pending(&job_id)?.map(format_instant);
        Ok(Some(PendingArchival { job_id, run_at }))
    }

    fn reservation_is_fresh(&self) -> Result<bool, TrackerError> {
        let Some(raw) = self
            .store
            .get_value(&self.keys.pending_archival_reserved_at())?
        else {
            return Ok(false);
        };
        let Ok(reserved_at) = parse_instant(&raw) else {
            tracing::warn!(raw = %raw, "unreadable archival reservation time");
            return Ok(false);
        };
        Ok(self.clock.now_utc() - reserved_at < RESERVATION_GRACE)
    }

    fn clear_marker_if(&self, job_id: &str) -> Result<bool, TrackerError> {
        let marker = self.keys.pending_archival_job();
        let reserved_at = self.keys.pending_archival_reserved_at();
        let locked = run_with_optimistic_lock(
            self.store.as_ref(),
            std::slice::from_ref(&marker),
            RetryLimit::AtMost(MARKER_RELEASE_ATTEMPTS),
            |_tx| Ok::<_, TrackerError>(self.store.get_value(&marker)?.as_deref() == Some(job_id)),
            |matches, tx| {
                if *matches {
                    tx.delete_value(&marker).delete_value(&reserved_at);
                }
                Ok(())
            },
        )?;
        Ok(locked.value)
    }
}

/// First instant of the next calendar day in `zone`, strictly after `now`.
///
/// When midnight does not exist locally the first valid instant after it is
/// used; when it occurs twice the earlier one wins.
pub fn next_cutoff(now: OffsetDateTime, zone: Tz) -> Result<OffsetDateTime, TrackerError> {
    let unresolvable = || TrackerError::InvalidTimeZone(zone.name().to_string());

    let utc = DateTime::<Utc>::from_timestamp(now.unix_timestamp(), now.nanosecond())
        .ok_or_else(unresolvable)?;
    let tomorrow = utc
        .with_timezone(&zone)
        .date_naive()
        .succ_opt()
        .ok_or_else(unresolvable)?;
    let mut local = tomorrow.and_hms_opt(0, 0, 0).ok_or_else(unresolvable)?;

    // transitions move clocks by at most a few hours
    for _ in 0..(24 * 4) {
        if let Some(instant) = zone.from_local_datetime(&local).earliest() {
            return OffsetDateTime::from_unix_timestamp(instant.timestamp())
                .map_err(|_| unresolvable());
        }
        local += ChronoDuration::minutes(15);
    }
    Err(unresolvable())
}
