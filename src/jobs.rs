use std::str::FromStr;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::{format_instant, parse_instant, Clock};
use crate::db::{self, Database};
use crate::errors::TrackerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ArchiveDoneTasks,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ArchiveDoneTasks => "archive_done_tasks",
        }
    }
}

impl FromStr for JobKind {
    type Err = TrackerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "archive_done_tasks" => Ok(JobKind::ArchiveDoneTasks),
            other => Err(TrackerError::UnknownJobKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Pending or running jobs still owe a drain.
    pub fn is_outstanding(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = TrackerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(TrackerError::UnknownJobStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub id: String,
    pub kind: JobKind,
    pub run_at: OffsetDateTime,
}

impl JobRequest {
    /// Identity is minted up front so it can be reserved before enqueueing.
    pub fn new(kind: JobKind, run_at: OffsetDateTime) -> Self {
        Self {
            id: new_job_id(),
            kind,
            run_at,
        }
    }
}

pub fn new_job_id() -> String {
    format!("J-{}", Uuid::now_v7())
}

/// Scheduled-execution collaborator used by the archival scheduler.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, request: JobRequest) -> Result<String, TrackerError>;
    /// Best effort; false when the job already ran or never existed.
    fn cancel(&self, job_id: &str) -> Result<bool, TrackerError>;
    /// Run time of the job while it is still waiting to be claimed.
    fn pending(&self, job_id: &str) -> Result<Option<OffsetDateTime>, TrackerError>;
    /// None when no job with this id was ever enqueued.
    fn status(&self, job_id: &str) -> Result<Option<JobStatus>, TrackerError>;
}

pub struct SqliteJobQueue {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl SqliteJobQueue {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, request: JobRequest) -> Result<String, TrackerError> {
        let conn = self.db.conn();
        db::insert_job(
            &conn,
            &request.id,
            request.kind.as_str(),
            &format_instant(request.run_at),
            JobStatus::Pending.as_str(),
            &format_instant(self.clock.now_utc()),
        )?;
        Ok(request.id)
    }

    fn cancel(&self, job_id: &str) -> Result<bool, TrackerError> {
        let conn = self.db.conn();
        Ok(db::transition_job(
            &conn,
            job_id,
            JobStatus::Pending.as_str(),
            JobStatus::Cancelled.as_str(),
        )?)
    }

    fn pending(&self, job_id: &str) -> Result<Option<OffsetDateTime>, TrackerError> {
        let record = {
            let conn = self.db.conn();
            db::get_job(&conn, job_id)?
        };
        match record {
            Some(record) if record.status == JobStatus::Pending.as_str() => {
                let run_at = parse_instant(&record.run_at)
                    .map_err(|_| TrackerError::InvalidTimestamp(record.run_at))?;
                Ok(Some(run_at))
            }
            _ => Ok(None),
        }
    }

    fn status(&self, job_id: &str) -> Result<Option<JobStatus>, TrackerError> {
        let record = {
            let conn = self.db.conn();
            db::get_job(&conn, job_id)?
        };
        record
            .map(|record| JobStatus::from_str(&record.status))
            .transpose()
    }
}
