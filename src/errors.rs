use std::error::Error;
use std::fmt;

use crate::locks::LockError;
use crate::volatile::StoreError;

/// Failures of the task tracking core: lifecycle, queries, scheduling,
/// archival and the worker.
#[derive(Debug)]
pub enum TrackerError {
    Store(StoreError),
    Db(rusqlite::Error),
    Lock(LockError),
    TaskNotFound(i64),
    InvalidTimestamp(String),
    InvalidTimeZone(String),
    UnknownJobKind(String),
    UnknownJobStatus(String),
    DrainAlreadyCommitted(String),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Store(err) => write!(f, "{}", err),
            TrackerError::Db(err) => write!(f, "database error: {}", err),
            TrackerError::Lock(err) => write!(f, "{}", err),
            TrackerError::TaskNotFound(id) => write!(f, "task '{}' not found", id),
            TrackerError::InvalidTimestamp(value) => {
                write!(f, "invalid timestamp '{}', expected RFC3339", value)
            }
            TrackerError::InvalidTimeZone(value) => {
                write!(f, "cannot resolve local midnight in time zone '{}'", value)
            }
            TrackerError::UnknownJobKind(kind) => write!(f, "unknown job kind '{}'", kind),
            TrackerError::UnknownJobStatus(status) => {
                write!(f, "unknown job status '{}'", status)
            }
            TrackerError::DrainAlreadyCommitted(job_id) => {
                write!(f, "archival job '{}' drained concurrently", job_id)
            }
        }
    }
}

impl Error for TrackerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrackerError::Store(err) => Some(err),
            TrackerError::Db(err) => Some(err),
            TrackerError::Lock(err) => Some(err),
            TrackerError::TaskNotFound(_) => None,
            TrackerError::InvalidTimestamp(_) => None,
            TrackerError::InvalidTimeZone(_) => None,
            TrackerError::UnknownJobKind(_) => None,
            TrackerError::UnknownJobStatus(_) => None,
            TrackerError::DrainAlreadyCommitted(_) => None,
        }
    }
}

impl From<StoreError> for TrackerError {
    fn from(value: StoreError) -> Self {
        TrackerError::Store(value)
    }
}

impl From<rusqlite::Error> for TrackerError {
    fn from(value: rusqlite::Error) -> Self {
        TrackerError::Db(value)
    }
}

impl From<LockError> for TrackerError {
    fn from(value: LockError) -> Self {
        TrackerError::Lock(value)
    }
}
