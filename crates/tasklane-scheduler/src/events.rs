//! Transition events, broadcast to subscribers as they are applied.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tasks::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    pub id: TaskId,
    /// `None` when the task was just created.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}
