use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::archive::{ArchivalJob, ArchiveSummary};
use crate::clock::{format_instant, Clock, SystemClock};
use crate::config::{Config, ConfigError};
use crate::db::{self, Database, JobRecord, NewTask};
use crate::domain::task::Task;
use crate::domain::task_kind::TaskKind;
use crate::errors::TrackerError;
use crate::jobs::{new_job_id, JobQueue, SqliteJobQueue};
use crate::lifecycle::TaskLifecycle;
use crate::locks::FileLock;
use crate::query::{TaskQueries, TaskScope};
use crate::scheduler::{next_cutoff, ArchivalScheduler, PendingArchival};
use crate::volatile::{Keyspace, SqliteStore, VolatileStore};
use crate::worker::{TickReport, Worker, WorkerSettings};

const RECENT_JOB_LIMIT: usize = 5;

pub struct App {
    db: Arc<Database>,
    queue: Arc<SqliteJobQueue>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<ArchivalScheduler>,
    lifecycle: TaskLifecycle,
    queries: TaskQueries,
    archive: Arc<ArchivalJob>,
    config: Config,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskView {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub kind: String,
    pub owner: String,
    pub state: String,
    pub current: bool,
    pub done: bool,
    pub done_time: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistoryEntryView {
    pub id: i64,
    pub task_id: i64,
    pub done_time: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScheduleView {
    pub timezone: String,
    pub next_cutoff: String,
    pub pending: Option<PendingArchival>,
    pub recent_jobs: Vec<JobView>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobView {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub run_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            status: record.status,
            run_at: record.run_at,
            attempts: record.attempts,
            last_error: record.last_error,
            created_at: record.created_at,
            finished_at: record.finished_at,
        }
    }
}

impl App {
    pub fn open(config: Config) -> Result<Self, AppError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub(crate) fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        let db_path = path_arg(&config.db_path)?;
        let volatile_path = path_arg(&config.volatile_path)?;
        ensure_parent_dir(&db_path)?;
        ensure_parent_dir(&volatile_path)?;

        let db = Arc::new(Database::open(&db_path)?);
        let store: Arc<dyn VolatileStore> =
            Arc::new(SqliteStore::open(&volatile_path).map_err(TrackerError::from)?);
        let keys = Keyspace::new(&config.key_prefix);
        let queue = Arc::new(SqliteJobQueue::new(Arc::clone(&db), Arc::clone(&clock)));
        let scheduler = Arc::new(ArchivalScheduler::new(
            Arc::clone(&store),
            keys.clone(),
            queue.clone(),
            Arc::clone(&clock),
            config.timezone,
        ));
        let lifecycle = TaskLifecycle::new(
            Arc::clone(&db),
            Arc::clone(&store),
            keys.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&clock),
        );
        let queries = TaskQueries::new(Arc::clone(&db), Arc::clone(&store), keys.clone());
        let archive = Arc::new(ArchivalJob::new(
            Arc::clone(&db),
            store,
            keys,
            Arc::clone(&clock),
        ));

        Ok(Self {
            db,
            queue,
            clock,
            scheduler,
            lifecycle,
            queries,
            archive,
            config,
        })
    }

    pub fn create_task(
        &self,
        title: &str,
        description: Option<&str>,
        kind: TaskKind,
        owner: Option<&str>,
    ) -> Result<TaskView, AppError> {
        let title = required_text("title", title)?;
        let owner = match owner {
            Some(owner) => required_text("owner", owner)?,
            None => self.config.owner.clone(),
        };
        let id = {
            let conn = self.db.conn();
            db::insert_task(
                &conn,
                &NewTask {
                    owner: &owner,
                    title: &title,
                    description: description.map(str::trim).unwrap_or_default(),
                    is_routine: kind.is_routine(),
                    created_at: &format_instant(self.clock.now_utc()),
                },
            )?
        };
        tracing::info!(task_id = id, kind = %kind, "created task");
        self.show_task(id)
    }

    pub fn update_task(
        &self,
        id: i64,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<TaskView, AppError> {
        if title.is_none() && description.is_none() {
            return Err(AppError::InvalidArgument(
                "edit requires --title or --desc".to_string(),
            ));
        }
        let task = self.queries.get(id)?;
        let title = match title {
            Some(title) => required_text("title", title)?,
            None => task.title,
        };
        let description = description
            .map(|value| value.trim().to_string())
            .unwrap_or(task.description);
        {
            let conn = self.db.conn();
            if !db::update_task(&conn, id, &title, &description)? {
                return Err(AppError::NotFound(id));
            }
        }
        self.show_task(id)
    }

    pub fn delete_task(&self, id: i64) -> Result<(), AppError> {
        self.queries.delete_task(id)?;
        self.scheduler.release_if_idle()?;
        Ok(())
    }

    pub fn show_task(&self, id: i64) -> Result<TaskView, AppError> {
        let task = self.queries.get(id)?;
        self.view(task)
    }

    pub fn list_tasks(&self, scope: TaskScope) -> Result<Vec<TaskView>, AppError> {
        self.queries
            .list(scope)?
            .into_iter()
            .map(|task| self.view(task))
            .collect()
    }

    pub fn set_current(&self, id: i64, flag: bool) -> Result<TaskView, AppError> {
        let task = self.queries.get(id)?;
        self.lifecycle.set_current(&task, flag)?;
        self.view(task)
    }

    pub fn set_done(&self, id: i64, flag: bool) -> Result<TaskView, AppError> {
        let task = self.queries.get(id)?;
        self.lifecycle.set_done(&task, flag)?;
        self.view(task)
    }

    pub fn history(&self, id: i64) -> Result<Vec<HistoryEntryView>, AppError> {
        Ok(self
            .queries
            .history(id)?
            .into_iter()
            .map(|entry| HistoryEntryView {
                id: entry.id,
                task_id: entry.task_id,
                done_time: entry.done_time,
            })
            .collect())
    }

    /// Runs archival immediately; the job queued for midnight is cancelled
    /// since its marker is consumed by this run.
    pub fn archive_now(&self) -> Result<ArchiveSummary, AppError> {
        let pending = self.scheduler.pending()?;
        let summary = self.archive.run(&new_job_id())?;
        if let Some(pending) = pending {
            if self.queue.cancel(&pending.job_id)? {
                tracing::debug!(job_id = %pending.job_id, "cancelled superseded archival job");
            }
        }
        Ok(summary)
    }

    pub fn schedule_status(&self) -> Result<ScheduleView, AppError> {
        let zone = self.scheduler.zone();
        let jobs = {
            let conn = self.db.conn();
            db::list_jobs(&conn)?
        };
        Ok(ScheduleView {
            timezone: zone.name().to_string(),
            next_cutoff: format_instant(next_cutoff(self.clock.now_utc(), zone)?),
            pending: self.scheduler.pending()?,
            recent_jobs: jobs
                .into_iter()
                .rev()
                .take(RECENT_JOB_LIMIT)
                .map(JobView::from)
                .collect(),
        })
    }

    /// With `once`, runs a single tick and returns its report; otherwise
    /// polls until the process is stopped.
    pub fn run_worker(
        &self,
        once: bool,
        poll_interval: Option<Duration>,
    ) -> Result<Option<TickReport>, AppError> {
        if poll_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(AppError::InvalidArgument(
                "poll interval must be at least one second".to_string(),
            ));
        }
        let lock_path = self.config.worker_lock_path();
        let _lock = FileLock::acquire_exclusive(&lock_path).map_err(TrackerError::from)?;

        let settings = WorkerSettings {
            poll_interval: poll_interval.unwrap_or(self.config.worker.poll_interval),
            ..self.config.worker
        };
        let worker = Worker::new(
            Arc::clone(&self.db),
            Arc::clone(&self.archive),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.clock),
            settings,
        );

        if once {
            worker.recover_interrupted()?;
            return Ok(Some(worker.tick()?));
        }
        worker.run()?;
        Ok(None)
    }

    fn view(&self, task: Task) -> Result<TaskView, AppError> {
        let state = self.lifecycle.state(&task)?;
        let current = self.lifecycle.is_current(&task)?;
        let done = self.lifecycle.is_done(&task)?;
        let done_time = self.lifecycle.done_time(&task)?.map(format_instant);
        Ok(TaskView {
            id: task.id,
            description: (!task.description.is_empty()).then_some(task.description),
            title: task.title,
            kind: task.kind.as_str().to_string(),
            owner: task.owner,
            state: state.as_str().to_string(),
            current,
            done,
            done_time,
            created_at: task.created_at,
        })
    }
}

fn required_text(field: &str, raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(trimmed.to_string())
}

fn path_arg(path: &Path) -> Result<String, AppError> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        AppError::InvalidArgument(format!("path '{}' is not valid UTF-8", path.display()))
    })
}

fn ensure_parent_dir(path: &str) -> Result<(), AppError> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[derive(Debug)]
pub enum AppError {
    Io(std::io::Error),
    Db(rusqlite::Error),
    Tracker(TrackerError),
    Config(ConfigError),
    InvalidArgument(String),
    NotFound(i64),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Io(err) => write!(f, "I/O error: {}", err),
            AppError::Db(err) => write!(f, "database error: {}", err),
            AppError::Tracker(err) => write!(f, "{}", err),
            AppError::Config(err) => write!(f, "{}", err),
            AppError::InvalidArgument(message) => write!(f, "{}", message),
            AppError::NotFound(id) => write!(f, "task '{}' not found", id),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Io(err) => Some(err),
            AppError::Db(err) => Some(err),
            AppError::Tracker(err) => Some(err),
            AppError::Config(err) => Some(err),
            AppError::InvalidArgument(_) => None,
            AppError::NotFound(_) => None,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::Io(value)
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        AppError::Db(value)
    }
}

impl From<TrackerError> for AppError {
    fn from(value: TrackerError) -> Self {
        match value {
            TrackerError::TaskNotFound(id) => AppError::NotFound(id),
            other => AppError::Tracker(other),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        AppError::Config(value)
    }
}
