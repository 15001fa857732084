pub mod state;
pub mod task;
pub mod task_kind;
