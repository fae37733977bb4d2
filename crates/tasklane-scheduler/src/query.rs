//! Listing, summaries and bulk operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::{Task, TaskId, TaskStatus};

/// Criteria for [`crate::Orchestrator::list_tasks`] and filtered bulk operations.
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    /// Only tasks created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.task_type.as_deref().is_none_or(|t| task.task_type == t)
            && self.created_before.is_none_or(|cutoff| task.created_at < cutoff)
    }
}

/// One page of tasks, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Matches before paging.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl TaskPage {
    pub(crate) fn from_matches(mut matches: Vec<Task>, limit: usize, offset: usize) -> Self {
        let total = matches.len();
        matches.reverse();
        let tasks = matches.into_iter().skip(offset).take(limit).collect();
        Self {
            tasks,
            total,
            limit,
            offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkOperation {
    Cancel,
    Retry,
    Delete,
}

impl std::fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkOperation::Cancel => write!(f, "cancel"),
            BulkOperation::Retry => write!(f, "retry"),
            BulkOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Which tasks a bulk operation applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkSelector {
    Ids(Vec<TaskId>),
    Filter(TaskFilter),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkReport {
    pub operation: BulkOperation,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BulkReport {
    pub(crate) fn new(operation: BulkOperation) -> Self {
        Self {
            operation,
            total: 0,
            successful: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, id: &TaskId, applied: bool) {
        self.total += 1;
        if applied {
            self.successful += 1;
        } else {
            self.failed += 1;
            self.errors
                .push(format!("{} not applicable to task {}", self.operation, id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Priority, fixture};

    #[test]
    fn test_filter_matching() {
        let mut task = fixture("report", 1, Priority::Normal, TaskStatus::Failed);
        let cutoff = task.created_at + chrono::Duration::seconds(1);

        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::default().status(TaskStatus::Failed).matches(&task));
        assert!(!TaskFilter::default().status(TaskStatus::Pending).matches(&task));
        assert!(!TaskFilter::default().task_type("cleanup").matches(&task));
        assert!(
            TaskFilter::default()
                .task_type("report")
                .created_before(cutoff)
                .matches(&task)
        );

        task.created_at = cutoff;
        assert!(!TaskFilter::default().created_before(cutoff).matches(&task));
    }

    #[test]
    fn test_page_is_newest_first() {
        let matches: Vec<Task> = (1..=5)
            .map(|seq| fixture("job", seq, Priority::Normal, TaskStatus::Pending))
            .collect();
        let page = TaskPage::from_matches(matches, 2, 1);
        assert_eq!(page.total, 5);
        let seqs: Vec<u64> = page.tasks.iter().map(|t| t.id.seq()).collect();
        assert_eq!(seqs, vec![4, 3]);
    }

    #[test]
    fn test_bulk_report_counts() {
        let mut report = BulkReport::new(BulkOperation::Cancel);
        report.record(&TaskId::new("job", 1), true);
        report.record(&TaskId::new("job", 2), false);
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors, vec!["cancel not applicable to task job_2".to_string()]);
    }
}
