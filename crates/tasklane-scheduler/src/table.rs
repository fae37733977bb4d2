//! Task table: the single owner of task state.
//!
//! Every mutation (promotion, dispatch, completion, cancel, retry, delete)
//! happens through `&mut TaskTable`, which the orchestrator only hands out
//! under its mutex. Transitions, queue pushes and metric updates for one
//! event therefore land atomically.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::deps::{self, DependencyIndex, StuckTask};
use crate::error::{ExecutionError, TransitionError};
use crate::events::TaskEvent;
use crate::metrics::{Gauges, Metrics, MetricsSnapshot};
use crate::queue::ReadyQueue;
use crate::registry::TaskOutput;
use crate::retry;
use crate::tasks::{Attempt, Task, TaskArgs, TaskId, TaskStatus};

/// Handle on a running body.
pub(crate) struct RunningHandle {
    pub abort: AbortHandle,
    pub interruptible: bool,
}

/// What a worker needs to run one attempt.
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub id: TaskId,
    pub task_type: String,
    pub args: TaskArgs,
    pub timeout: Duration,
    pub attempt: u32,
}

/// How a finished attempt was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finished {
    Completed { promoted: usize },
    Retrying { retry_count: u32, delay: Duration },
    Failed,
    Cancelled,
    /// The result arrived for a task no longer Running and was dropped.
    Ignored,
}

pub(crate) struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    queue: ReadyQueue,
    deps: DependencyIndex,
    metrics: Metrics,
    running: HashMap<TaskId, RunningHandle>,
    next_seq: u64,
    events: broadcast::Sender<TaskEvent>,
    max_retry_delay: Duration,
}

/// Apply one lifecycle edge and publish it.
fn set_status(
    task: &mut Task,
    to: TaskStatus,
    now: DateTime<Utc>,
    events: &broadcast::Sender<TaskEvent>,
) -> Result<(), TransitionError> {
    let from = task.transition_to(to)?;
    // No subscribers is fine.
    let _ = events.send(TaskEvent {
        id: task.id.clone(),
        from: Some(from),
        to,
        at: now,
    });
    Ok(())
}

fn elapsed_since(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    started_at
        .and_then(|start| (now - start).to_std().ok())
        .unwrap_or_default()
}

impl TaskTable {
    pub fn new(
        now: DateTime<Utc>,
        events: broadcast::Sender<TaskEvent>,
        max_retry_delay: Duration,
    ) -> Self {
        Self {
            tasks: HashMap::new(),
            queue: ReadyQueue::new(),
            deps: DependencyIndex::new(),
            metrics: Metrics::new(now),
            running: HashMap::new(),
            next_seq: 0,
            events,
            max_retry_delay,
        }
    }

    /// Reserve the next id. Sequence numbers are never handed out twice.
    pub fn next_id(&mut self, task_type: &str) -> TaskId {
        self.next_seq += 1;
        TaskId::new(task_type, self.next_seq)
    }

    pub fn insert(&mut self, task: Task, now: DateTime<Utc>) {
        self.deps.add(&task);
        self.metrics.record_created();
        let _ = self.events.send(TaskEvent {
            id: task.id.clone(),
            from: None,
            to: task.status,
            at: now,
        });
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Clones of matching tasks, in submission order.
    pub fn select(&self, pred: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut out: Vec<Task> = self.tasks.values().filter(|&t| pred(t)).cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn count_where(&self, pred: impl Fn(&Task) -> bool) -> usize {
        self.tasks.values().filter(|&t| pred(t)).count()
    }

    fn is_ready(&self, task: &Task, now: DateTime<Utc>) -> bool {
        task.status == TaskStatus::Pending
            && task.is_due_at(now)
            && deps::dependencies_met(task, &self.tasks)
    }

    fn promote(&mut self, id: &TaskId, now: DateTime<Utc>) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        match set_status(task, TaskStatus::Queued, now, &self.events) {
            Ok(()) => {
                self.queue.push(task);
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ Promotion skipped: {e}");
                false
            }
        }
    }

    /// Duty (a): move every ready Pending task into the queue.
    pub fn promote_ready(&mut self, now: DateTime<Utc>) -> usize {
        let mut ready: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| self.is_ready(t, now))
            .map(|t| t.id.clone())
            .collect();
        ready.sort();
        ready.iter().filter(|id| self.promote(id, now)).count()
    }

    /// Re-evaluate only the tasks waiting on `completed`.
    pub fn promote_dependents(&mut self, completed: &TaskId, now: DateTime<Utc>) -> usize {
        let ready: Vec<TaskId> = self
            .deps
            .dependents_of(completed)
            .into_iter()
            .filter(|id| self.tasks.get(id).is_some_and(|t| self.is_ready(t, now)))
            .collect();
        let promoted = ready.iter().filter(|id| self.promote(id, now)).count();
        if promoted > 0 {
            tracing::debug!("🔗 {} dependent(s) of {} promoted", promoted, completed);
        }
        promoted
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Pop the best queued task, discarding entries whose task left Queued.
    pub fn pop_dispatchable(&mut self) -> Option<TaskId> {
        while let Some(id) = self.queue.pop() {
            match self.tasks.get(&id) {
                Some(task) if task.status == TaskStatus::Queued => return Some(id),
                _ => tracing::debug!("🗑️ Dropping stale queue entry {}", id),
            }
        }
        None
    }

    /// Queued → Running, opening a new attempt record.
    pub fn start(&mut self, id: &TaskId, now: DateTime<Utc>) -> Option<Dispatch> {
        let task = self.tasks.get_mut(id)?;
        if let Err(e) = set_status(task, TaskStatus::Running, now, &self.events) {
            tracing::warn!("⚠️ Dispatch skipped: {e}");
            return None;
        }
        task.started_at = Some(now);
        task.completed_at = None;
        task.duration = None;
        task.result = None;
        task.cancel_requested = false;
        let attempt = task.attempts.len() as u32 + 1;
        task.attempts.push(Attempt {
            number: attempt,
            started_at: now,
            finished_at: None,
            error: None,
        });
        Some(Dispatch {
            id: id.clone(),
            task_type: task.task_type.clone(),
            args: task.args.clone(),
            timeout: task.timeout,
            attempt,
        })
    }

    pub fn attach(&mut self, id: TaskId, handle: RunningHandle) {
        self.running.insert(id, handle);
    }

    /// Worker-completion path: record the outcome and pick the next state.
    pub fn finish(&mut self, id: &TaskId, output: TaskOutput, now: DateTime<Utc>) -> Finished {
        self.running.remove(id);
        let Some(task) = self.tasks.get_mut(id) else {
            tracing::warn!("⚠️ Result for unknown task {} dropped", id);
            return Finished::Ignored;
        };
        if task.status != TaskStatus::Running {
            tracing::debug!("Result for {} dropped: task is {}", id, task.status);
            return Finished::Ignored;
        }

        let elapsed = elapsed_since(task.started_at, now);
        task.completed_at = Some(now);
        task.duration = Some(elapsed);

        if task.cancel_requested {
            task.finish_attempt(now, Some("cancelled".into()));
            if let Err(e) = set_status(task, TaskStatus::Cancelled, now, &self.events) {
                tracing::warn!("⚠️ {e}");
                return Finished::Ignored;
            }
            self.metrics.record_cancelled();
            tracing::info!("🚫 Task {} finished after cancel request; result discarded", id);
            return Finished::Cancelled;
        }

        match output {
            Ok(value) => {
                task.result = Some(value);
                task.error = None;
                task.finish_attempt(now, None);
                if let Err(e) = set_status(task, TaskStatus::Completed, now, &self.events) {
                    tracing::warn!("⚠️ {e}");
                    return Finished::Ignored;
                }
                self.metrics.record_completed(elapsed);
                tracing::info!(
                    "✅ Task completed: '{}' ({}) in {:.2}s",
                    task.name,
                    id,
                    elapsed.as_secs_f64()
                );
                let promoted = self.promote_dependents(id, now);
                Finished::Completed { promoted }
            }
            Err(error) => {
                let message = error.to_string();
                task.error = Some(message.clone());
                task.finish_attempt(now, Some(message));
                if let Err(e) = set_status(task, TaskStatus::Failed, now, &self.events) {
                    tracing::warn!("⚠️ {e}");
                    return Finished::Ignored;
                }
                self.metrics.record_failed_attempt(elapsed);
                tracing::warn!(
                    "❌ Task '{}' ({}) failed on attempt {}: {}",
                    task.name,
                    id,
                    task.attempts.len(),
                    error
                );
                match self.reschedule_failed(id, now) {
                    Some((retry_count, delay)) => Finished::Retrying { retry_count, delay },
                    None => {
                        self.metrics.record_terminal_failure();
                        Finished::Failed
                    }
                }
            }
        }
    }

    /// Failed → Retrying → Pending with backoff. Only valid from Failed, so
    /// automatic and manual retry cannot both apply to one failure.
    fn reschedule_failed(&mut self, id: &TaskId, now: DateTime<Utc>) -> Option<(u32, Duration)> {
        let cap = self.max_retry_delay;
        let task = self.tasks.get_mut(id)?;
        if task.status != TaskStatus::Failed {
            return None;
        }
        let Some((retry_count, delay)) = retry::next_retry(task, cap) else {
            tracing::warn!(
                "⚠️ Task {} has exhausted its retries ({}/{})",
                id,
                task.retry_count,
                task.max_retries
            );
            return None;
        };
        if let Err(e) = set_status(task, TaskStatus::Retrying, now, &self.events) {
            tracing::warn!("⚠️ {e}");
            return None;
        }
        task.retry_count = retry_count;
        task.error = None;
        let step = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        task.scheduled_at = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Err(e) = set_status(task, TaskStatus::Pending, now, &self.events) {
            tracing::warn!("⚠️ {e}");
            return None;
        }
        self.metrics.record_retry();
        tracing::info!(
            "🔁 Task {} retry {}/{} scheduled in {:?}",
            id,
            retry_count,
            task.max_retries,
            delay
        );
        Some((retry_count, delay))
    }

    /// Manual retry of a Failed task.
    pub fn retry(&mut self, id: &TaskId, now: DateTime<Utc>) -> bool {
        self.reschedule_failed(id, now).is_some()
    }

    pub fn cancel(&mut self, id: &TaskId, now: DateTime<Utc>) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        match task.status {
            status if status.is_pre_dispatch() => {
                if set_status(task, TaskStatus::Cancelled, now, &self.events).is_err() {
                    return false;
                }
                task.completed_at = Some(now);
                self.metrics.record_cancelled();
                tracing::info!("🚫 Cancelled task {} ({})", id, status);
                true
            }
            TaskStatus::Running => {
                let interruptible = self.running.get(id).is_some_and(|h| h.interruptible);
                if !interruptible {
                    task.cancel_requested = true;
                    tracing::info!(
                        "⏳ Task {} cannot be interrupted; it will run to completion and its result will be discarded",
                        id
                    );
                    return false;
                }
                if set_status(task, TaskStatus::Cancelled, now, &self.events).is_err() {
                    return false;
                }
                if let Some(handle) = self.running.remove(id) {
                    handle.abort.abort();
                }
                task.completed_at = Some(now);
                task.duration = Some(elapsed_since(task.started_at, now));
                task.finish_attempt(now, Some("cancelled".into()));
                self.metrics.record_cancelled();
                tracing::info!("🚫 Cancelled running task {}", id);
                true
            }
            _ => false,
        }
    }

    /// Administrative removal. Refused while the task is Running or Queued,
    /// or while a Queued task was promoted on the strength of it.
    pub fn delete(&mut self, id: &TaskId) -> bool {
        let Some(task) = self.tasks.get(id) else {
            return false;
        };
        if matches!(task.status, TaskStatus::Running | TaskStatus::Queued) {
            return false;
        }
        let has_queued_dependent = self
            .deps
            .dependents_of(id)
            .iter()
            .any(|d| self.tasks.get(d).is_some_and(|t| t.status == TaskStatus::Queued));
        if has_queued_dependent {
            return false;
        }
        match self.tasks.remove(id) {
            Some(task) => {
                self.deps.remove(&task);
                tracing::info!("🗑️ Deleted task {}", id);
                true
            }
            None => false,
        }
    }

    /// Abort every running body and mark its task Cancelled. Used when
    /// shutdown gives up waiting. Blocking bodies keep their thread.
    pub fn abort_running(&mut self, now: DateTime<Utc>) -> usize {
        let handles: Vec<(TaskId, RunningHandle)> = self.running.drain().collect();
        let mut aborted = 0;
        for (id, handle) in handles {
            handle.abort.abort();
            if let Some(task) = self.tasks.get_mut(&id)
                && set_status(task, TaskStatus::Cancelled, now, &self.events).is_ok()
            {
                let error = ExecutionError::new("aborted at shutdown").to_string();
                task.completed_at = Some(now);
                task.duration = Some(elapsed_since(task.started_at, now));
                task.error = Some(error.clone());
                task.finish_attempt(now, Some(error));
                self.metrics.record_cancelled();
                aborted += 1;
            }
        }
        aborted
    }

    pub fn stuck(&self) -> Vec<StuckTask> {
        deps::stuck_tasks(&self.tasks)
    }

    pub fn metrics(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let gauges = Gauges {
            active: self.count_where(|t| t.status == TaskStatus::Running),
            queued: self.count_where(|t| t.status == TaskStatus::Queued),
            total: self.tasks.len(),
        };
        self.metrics.snapshot(now, gauges)
    }

    pub fn reset_metrics(&mut self, now: DateTime<Utc>) {
        self.metrics.reset(now);
    }
}
