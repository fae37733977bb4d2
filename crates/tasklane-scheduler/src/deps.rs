//! Dependency resolution.
//!
//! A task is eligible only when every dependency exists and is Completed.
//! Missing dependencies are never treated as satisfied: the dependent stays
//! Pending and shows up in [`stuck_tasks`].

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::tasks::{Task, TaskId, TaskStatus};

/// Reverse index: dependency id → tasks waiting on it.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    dependents: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: &Task) {
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.id.clone());
        }
    }

    /// Drop `task` from the waiting lists of its own dependencies.
    pub fn remove(&mut self, task: &Task) {
        for dep in &task.dependencies {
            if let Some(waiting) = self.dependents.get_mut(dep) {
                waiting.remove(&task.id);
                if waiting.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
    }

    /// Tasks that declared `id` as a dependency, in submission order.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let mut ids: Vec<_> = self
            .dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// Every dependency of `task` exists in `tasks` and is Completed.
pub fn dependencies_met(task: &Task, tasks: &HashMap<TaskId, Task>) -> bool {
    task.dependencies.iter().all(|dep| {
        tasks
            .get(dep)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
}

/// A Pending task that can never become ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckTask {
    pub id: TaskId,
    /// Dependencies that do not exist (never created, or deleted).
    pub missing: BTreeSet<TaskId>,
    /// Dependencies that ended Failed (terminal) or Cancelled.
    pub unsuccessful: BTreeSet<TaskId>,
}

/// Pending tasks blocked by missing or terminally unsuccessful dependencies.
pub fn stuck_tasks(tasks: &HashMap<TaskId, Task>) -> Vec<StuckTask> {
    let mut stuck: Vec<StuckTask> = tasks
        .values()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter_map(|task| {
            let mut missing = BTreeSet::new();
            let mut unsuccessful = BTreeSet::new();
            for dep in &task.dependencies {
                match tasks.get(dep) {
                    None => {
                        missing.insert(dep.clone());
                    }
                    Some(d)
                        if d.status == TaskStatus::Cancelled
                            || (d.status == TaskStatus::Failed && d.is_terminal()) =>
                    {
                        unsuccessful.insert(dep.clone());
                    }
                    Some(_) => {}
                }
            }
            (!missing.is_empty() || !unsuccessful.is_empty()).then(|| StuckTask {
                id: task.id.clone(),
                missing,
                unsuccessful,
            })
        })
        .collect();
    stuck.sort_by(|a, b| a.id.cmp(&b.id));
    stuck
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Priority, fixture};

    fn task(seq: u64, status: TaskStatus, deps: &[u64]) -> Task {
        let mut task = fixture("t", seq, Priority::Normal, status);
        task.dependencies = deps.iter().map(|d| TaskId::new("t", *d)).collect();
        task
    }

    fn table(tasks: Vec<Task>) -> HashMap<TaskId, Task> {
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
    }

    #[test]
    fn test_dependencies_met_requires_completed() {
        let tasks = table(vec![
            task(1, TaskStatus::Completed, &[]),
            task(2, TaskStatus::Running, &[]),
            task(3, TaskStatus::Pending, &[1]),
            task(4, TaskStatus::Pending, &[1, 2]),
        ]);
        assert!(dependencies_met(&tasks[&TaskId::new("t", 3)], &tasks));
        assert!(!dependencies_met(&tasks[&TaskId::new("t", 4)], &tasks));
    }

    #[test]
    fn test_missing_dependency_is_never_met() {
        let tasks = table(vec![task(1, TaskStatus::Pending, &[99])]);
        assert!(!dependencies_met(&tasks[&TaskId::new("t", 1)], &tasks));
        let stuck = stuck_tasks(&tasks);
        assert_eq!(stuck.len(), 1);
        assert!(stuck[0].missing.contains(&TaskId::new("t", 99)));
    }

    #[test]
    fn test_stuck_reports_cancelled_dependency() {
        let tasks = table(vec![
            task(1, TaskStatus::Cancelled, &[]),
            task(2, TaskStatus::Pending, &[1]),
            task(3, TaskStatus::Pending, &[]),
        ]);
        let stuck = stuck_tasks(&tasks);
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, TaskId::new("t", 2));
        assert!(stuck[0].unsuccessful.contains(&TaskId::new("t", 1)));
    }

    #[test]
    fn test_reverse_index() {
        let mut index = DependencyIndex::new();
        let a = task(2, TaskStatus::Pending, &[1]);
        let b = task(3, TaskStatus::Pending, &[1]);
        index.add(&a);
        index.add(&b);
        assert_eq!(
            index.dependents_of(&TaskId::new("t", 1)),
            vec![TaskId::new("t", 2), TaskId::new("t", 3)]
        );
        index.remove(&a);
        assert_eq!(index.dependents_of(&TaskId::new("t", 1)), vec![TaskId::new("t", 3)]);
        index.remove(&b);
        assert!(index.dependents_of(&TaskId::new("t", 1)).is_empty());
    }
}
