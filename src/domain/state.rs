use std::fmt;

use serde::{Serialize, Serializer};

use super::task_kind::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Later,
    Current,
    Done,
    Archived,
}

impl LifecycleState {
    /// Archival history outranks volatile membership, and only reminders can
    /// be archived.
    pub fn derive(kind: TaskKind, has_history: bool, current: bool, done: bool) -> Self {
        if kind == TaskKind::Reminder && has_history {
            return LifecycleState::Archived;
        }
        match (current, done) {
            (_, true) => LifecycleState::Done,
            (true, false) => LifecycleState::Current,
            (false, false) => LifecycleState::Later,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Later => "later",
            LifecycleState::Current => "current",
            LifecycleState::Done => "done",
            LifecycleState::Archived => "archived",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LifecycleState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
