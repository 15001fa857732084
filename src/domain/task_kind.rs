use std::error::Error;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// Fixed when a task is created and never reassigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Completes once; archival files it away for good.
    #[default]
    Reminder,
    /// Completes once per cycle; archival resets it.
    Routine,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::Reminder, TaskKind::Routine];

    pub fn from_routine_flag(is_routine: bool) -> Self {
        if is_routine {
            TaskKind::Routine
        } else {
            TaskKind::Reminder
        }
    }

    pub fn is_routine(self) -> bool {
        matches!(self, TaskKind::Routine)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Reminder => "reminder",
            TaskKind::Routine => "routine",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ParseTaskKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reminder" | "once" | "one_shot" => Ok(TaskKind::Reminder),
            "routine" | "daily" | "recurring" => Ok(TaskKind::Routine),
            _ => Err(ParseTaskKindError {
                value: value.to_string(),
            }),
        }
    }
}

impl Serialize for TaskKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTaskKindError {
    value: String,
}

impl fmt::Display for ParseTaskKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid task kind '{}': expected one of {}",
            self.value,
            TaskKind::ALL
                .iter()
                .map(|kind| kind.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl Error for ParseTaskKindError {}
