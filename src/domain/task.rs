use crate::db::TaskRecord;

use super::task_kind::TaskKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub owner: String,
    pub title: String,
    pub description: String,
    pub kind: TaskKind,
    pub created_at: String,
}

impl From<TaskRecord> for Task {
    fn from(value: TaskRecord) -> Self {
        Self {
            id: value.id,
            owner: value.owner,
            title: value.title,
            description: value.description,
            kind: TaskKind::from_routine_flag(value.is_routine),
            created_at: value.created_at,
        }
    }
}
