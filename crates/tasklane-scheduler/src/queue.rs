//! Ready queue: orders Queued tasks for dispatch.
//!
//! Strict priority, highest first; equal priorities dispatch in submission
//! order using the sequence number embedded in the task id.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::tasks::{Priority, Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // Lower sequence wins a tie: reverse for the max-heap.
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap of ready task ids.
///
/// Entries are not removed on cancellation; callers discard stale ids when
/// they pop them.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: &Task) {
        tracing::debug!(
            "📥 Queue push: {} (priority: {}, depth: {})",
            task.id,
            task.priority,
            self.heap.len() + 1
        );
        self.heap.push(QueueEntry {
            priority: task.priority,
            seq: task.id.seq(),
            id: task.id.clone(),
        });
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|entry| entry.id)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
