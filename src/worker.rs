use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::archive::{ArchivalJob, ArchiveSummary};
use crate::clock::{format_instant, Clock};
use crate::db::{self, Database, JobRecord};
use crate::errors::TrackerError;
use crate::jobs::{JobKind, JobStatus};
use crate::scheduler::ArchivalScheduler;

const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_attempts: 5,
            retry_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        job_id: String,
        summary: ArchiveSummary,
    },
    Retrying {
        job_id: String,
        attempts: u32,
        next_run_at: String,
        error: String,
    },
    Failed {
        job_id: String,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Job queued by reconciliation, if the marker needed repair.
    pub rescheduled: Option<String>,
    pub jobs: Vec<JobOutcome>,
}

/// Executes due archival jobs from the durable queue.
pub struct Worker {
    db: Arc<Database>,
    archive: Arc<ArchivalJob>,
    scheduler: Arc<ArchivalScheduler>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        db: Arc<Database>,
        archive: Arc<ArchivalJob>,
        scheduler: Arc<ArchivalScheduler>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            db,
            archive,
            scheduler,
            clock,
            settings,
        }
    }

    /// Jobs left `running` by a worker that died mid-run go back to pending.
    /// Only valid while holding the worker lock.
    pub fn recover_interrupted(&self) -> Result<usize, TrackerError> {
        let conn = self.db.conn();
        let recovered = db::transition_all_jobs(
            &conn,
            JobStatus::Running.as_str(),
            JobStatus::Pending.as_str(),
        )?;
        if recovered > 0 {
            tracing::warn!(recovered, "requeued interrupted jobs");
        }
        Ok(recovered)
    }

    pub fn tick(&self) -> Result<TickReport, TrackerError> {
        let mut report = TickReport {
            rescheduled: self.scheduler.reconcile()?,
            jobs: Vec::new(),
        };

        loop {
            let now = format_instant(self.clock.now_utc());
            let claimed = {
                let conn = self.db.conn();
                match db::next_due_job(&conn, JobStatus::Pending.as_str(), &now)? {
                    Some(job) => db::transition_job(
                        &conn,
                        &job.id,
                        JobStatus::Pending.as_str(),
                        JobStatus::Running.as_str(),
                    )?
                    .then_some(job),
                    None => break,
                }
            };
            if let Some(job) = claimed {
                report.jobs.push(self.execute(&job)?);
            }
        }
        Ok(report)
    }

    /// Polls forever; tick failures are logged and retried on the next poll.
    pub fn run(&self) -> Result<(), TrackerError> {
        self.recover_interrupted()?;
        tracing::info!(
            poll_secs = self.settings.poll_interval.as_secs(),
            "worker started"
        );
        loop {
            match self.tick() {
                Ok(report) if !report.jobs.is_empty() || report.rescheduled.is_some() => {
                    tracing::debug!(jobs = report.jobs.len(), "worker tick")
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "worker tick failed"),
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }

    fn execute(&self, job: &JobRecord) -> Result<JobOutcome, TrackerError> {
        let result = match JobKind::from_str(&job.kind) {
            Ok(JobKind::ArchiveDoneTasks) => self.archive.run(&job.id),
            Err(err) => Err(err),
        };
        let attempts = u32::try_from(job.attempts).unwrap_or(u32::MAX).saturating_add(1);
        let now = self.clock.now_utc();
        let conn = self.db.conn();

        match result {
            Ok(summary) => {
                db::record_job_attempt(
                    &conn,
                    &job.id,
                    JobStatus::Succeeded.as_str(),
                    &job.run_at,
                    None,
                    Some(&format_instant(now)),
                )?;
                Ok(JobOutcome::Succeeded {
                    job_id: job.id.clone(),
                    summary,
                })
            }
            Err(err) if attempts >= self.settings.max_attempts => {
                let error = err.to_string();
                tracing::error!(job_id = %job.id, attempts, error = %error, "job failed permanently");
                db::record_job_attempt(
                    &conn,
                    &job.id,
                    JobStatus::Failed.as_str(),
                    &job.run_at,
                    Some(&error),
                    Some(&format_instant(now)),
                )?;
                Ok(JobOutcome::Failed {
                    job_id: job.id.clone(),
                    attempts,
                    error,
                })
            }
            Err(err) => {
                let error = err.to_string();
                let next_run_at = format_instant(now + backoff(self.settings.retry_backoff, attempts));
                tracing::warn!(
                    job_id = %job.id,
                    attempts,
                    next_run_at = %next_run_at,
                    error = %error,
                    "job failed; retrying"
                );
                db::record_job_attempt(
                    &conn,
                    &job.id,
                    JobStatus::Pending.as_str(),
                    &next_run_at,
                    Some(&error),
                    None,
                )?;
                Ok(JobOutcome::Retrying {
                    job_id: job.id.clone(),
                    attempts,
                    next_run_at,
                    error,
                })
            }
        }
    }
}

/// `base * 2^(attempts - 1)`, capped at an hour.
fn backoff(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}
