use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono_tz::Tz;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::archive::{ArchivalJob, ArchiveSummary};
use crate::clock::{format_instant, Clock};
use crate::db::{self, Database, HistoryRecord, JobRecord, NewTask};
use crate::domain::task::Task;
use crate::jobs::{new_job_id, SqliteJobQueue};
use crate::lifecycle::TaskLifecycle;
use crate::query::TaskQueries;
use crate::scheduler::ArchivalScheduler;
use crate::volatile::{Keyspace, MemoryStore, VolatileStore};

pub(crate) const START: OffsetDateTime = datetime!(2026-10-16 12:00 UTC);

pub(crate) struct TestDir {
    root: PathBuf,
}

impl TestDir {
    pub(crate) fn new(prefix: &str) -> Self {
        let root = std::env::temp_dir().join(format!("actionist-{}-{}", prefix, Uuid::now_v7()));
        std::fs::create_dir_all(&root).expect("temp dir should be creatable");
        Self { root }
    }

    pub(crate) fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub(crate) fn database(&self) -> Arc<Database> {
        let path = self.path("actionist.db");
        Arc::new(Database::open(&path.display().to_string()).expect("database should open"))
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub(crate) struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub(crate) fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub(crate) fn set(&self, value: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fully wired components over a temp database and an in-memory volatile
/// store, with the clock pinned to `START` in New York.
pub(crate) struct Harness {
    pub(crate) db: Arc<Database>,
    pub(crate) store: Arc<dyn VolatileStore>,
    pub(crate) keys: Keyspace,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) queue: Arc<SqliteJobQueue>,
    pub(crate) scheduler: Arc<ArchivalScheduler>,
    pub(crate) lifecycle: TaskLifecycle,
    pub(crate) queries: TaskQueries,
    pub(crate) archive: ArchivalJob,
    _dir: TestDir,
}

impl Harness {
    pub(crate) fn new(prefix: &str) -> Self {
        Self::with_store(prefix, Arc::new(MemoryStore::new()))
    }

    pub(crate) fn with_store(prefix: &str, store: Arc<dyn VolatileStore>) -> Self {
        let dir = TestDir::new(prefix);
        let db = dir.database();
        let keys = Keyspace::default();
        let clock = Arc::new(ManualClock::new(START));
        let zone: Tz = "America/New_York".parse().expect("zone should parse");

        let queue = Arc::new(SqliteJobQueue::new(Arc::clone(&db), clock.clone()));
        let scheduler = Arc::new(ArchivalScheduler::new(
            Arc::clone(&store),
            keys.clone(),
            queue.clone(),
            clock.clone(),
            zone,
        ));
        let lifecycle = TaskLifecycle::new(
            Arc::clone(&db),
            Arc::clone(&store),
            keys.clone(),
            Arc::clone(&scheduler),
            clock.clone(),
        );
        let queries = TaskQueries::new(Arc::clone(&db), Arc::clone(&store), keys.clone());
        let archive = ArchivalJob::new(
            Arc::clone(&db),
            Arc::clone(&store),
            keys.clone(),
            clock.clone(),
        );

        Self {
            db,
            store,
            keys,
            clock,
            queue,
            scheduler,
            lifecycle,
            queries,
            archive,
            _dir: dir,
        }
    }

    fn task(&self, title: &str, is_routine: bool) -> Task {
        let conn = self.db.conn();
        let id = db::insert_task(
            &conn,
            &NewTask {
                owner: "ana",
                title,
                description: "",
                is_routine,
                created_at: &format_instant(self.clock.now_utc()),
            },
        )
        .expect("task insert should succeed");
        db::get_task(&conn, id)
            .expect("task lookup")
            .map(Task::from)
            .expect("inserted task should exist")
    }

    pub(crate) fn reminder(&self, title: &str) -> Task {
        self.task(title, false)
    }

    pub(crate) fn routine(&self, title: &str) -> Task {
        self.task(title, true)
    }

    /// Runs archival under the pending marker's job id, or a fresh one.
    pub(crate) fn archive_now(&self) -> ArchiveSummary {
        let job_id = self
            .store
            .get_value(&self.keys.pending_archival_job())
            .expect("marker read")
            .unwrap_or_else(new_job_id);
        self.archive.run(&job_id).expect("archival should succeed")
    }

    pub(crate) fn reconcile_once(&self) -> Option<String> {
        self.scheduler.reconcile().expect("reconcile should succeed")
    }

    pub(crate) fn jobs(&self) -> Vec<JobRecord> {
        let conn = self.db.conn();
        db::list_jobs(&conn).expect("jobs should list")
    }

    pub(crate) fn history(&self, task_id: i64) -> Vec<HistoryRecord> {
        let conn = self.db.conn();
        db::list_history(&conn, task_id).expect("history should list")
    }
}
