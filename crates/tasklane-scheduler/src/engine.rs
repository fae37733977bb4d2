//! Orchestrator engine: the handle callers hold and the coordinating loop.
//!
//! The loop wakes every tick interval (or early, when a submission, retry or
//! worker completion makes progress possible), promotes ready tasks, and
//! dispatches queued tasks into free worker slots. Workers run each body in
//! its own tokio task under a timeout and report back through the task
//! table, which re-evaluates dependents on the spot.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, RwLock, broadcast, watch};
use tokio::task::JoinHandle;

use tasklane_core::config::{SchedulerConfig, SeedTask, TasklaneConfig};

use crate::clock::{Clock, SystemClock};
use crate::deps::StuckTask;
use crate::error::{ExecutionError, SchedulingFault, ValidationError};
use crate::events::TaskEvent;
use crate::metrics::MetricsSnapshot;
use crate::pool::WorkerPool;
use crate::query::{BulkOperation, BulkReport, BulkSelector, TaskFilter, TaskPage};
use crate::registry::{ExecutorRegistry, TaskExecutor, TaskOutput, panic_message};
use crate::retry::FaultBackoff;
use crate::table::{Dispatch, Finished, RunningHandle, TaskTable};
use crate::tasks::{NewTask, Priority, Task, TaskArgs, TaskId, TaskStatus};

/// Fallbacks applied to submissions that leave a field unset.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefaults {
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub dispatched: usize,
    pub reaped: usize,
    /// Tasks that could not be dispatched; each was isolated and logged.
    pub task_faults: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.promoted == 0 && self.dispatched == 0 && self.reaped == 0
    }
}

struct Lifecycle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: SchedulerConfig,
    defaults: TaskDefaults,
    clock: Arc<dyn Clock>,
    registry: RwLock<ExecutorRegistry>,
    table: Mutex<TaskTable>,
    pool: WorkerPool,
    wake: Notify,
    events: broadcast::Sender<TaskEvent>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Inner {
    async fn complete(&self, id: &TaskId, output: TaskOutput) -> Finished {
        let now = self.clock.now();
        self.table.lock().await.finish(id, output, now)
    }
}

/// Cheaply cloneable handle on one orchestrator instance.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: &TasklaneConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build with an explicit time source for scheduling decisions.
    pub fn with_clock(config: &TasklaneConfig, clock: Arc<dyn Clock>) -> Self {
        // `TasklaneConfig::validate` rejects bad names; configs built in code may skip it.
        let priority = config.defaults.priority.parse().unwrap_or_else(|e| {
            tracing::warn!("⚠️ Default priority: {e}, using normal");
            Priority::Normal
        });
        let defaults = TaskDefaults {
            priority,
            max_retries: config.defaults.max_retries,
            retry_delay: config.defaults.retry_delay(),
            timeout: config.defaults.timeout(),
        };
        let (events, _) = broadcast::channel(config.scheduler.event_buffer.max(1));
        let table = TaskTable::new(
            clock.now(),
            events.clone(),
            config.defaults.max_retry_delay(),
        );
        let workers = config.scheduler.max_workers.max(1);

        Self {
            inner: Arc::new(Inner {
                config: config.scheduler.clone(),
                defaults,
                clock,
                registry: RwLock::new(ExecutorRegistry::new()),
                table: Mutex::new(table),
                pool: WorkerPool::new(workers),
                wake: Notify::new(),
                events,
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn defaults(&self) -> &TaskDefaults {
        &self.inner.defaults
    }

    pub fn worker_capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    // ── Registry ───────────────────────────────────────────

    pub async fn register_task_type(
        &self,
        type_id: &str,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), ValidationError> {
        self.inner.registry.write().await.register(type_id, executor)
    }

    pub async fn registered_types(&self) -> Vec<String> {
        self.inner.registry.read().await.types()
    }

    // ── Submission ─────────────────────────────────────────

    /// Validate and enqueue a submission. The task starts Pending.
    pub async fn create_task(&self, new: NewTask) -> Result<TaskId, ValidationError> {
        if new.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !self.inner.registry.read().await.contains(&new.task_type) {
            return Err(ValidationError::UnknownTaskType(new.task_type));
        }
        let timeout = new.timeout.unwrap_or(self.inner.defaults.timeout);
        if timeout.is_zero() {
            return Err(ValidationError::ZeroTimeout);
        }
        let now = self.inner.clock.now();
        let scheduled_at = match &new.schedule {
            Some(schedule) => schedule.resolve(now)?,
            None => now,
        };
        let priority = new.priority.unwrap_or(self.inner.defaults.priority);

        let id = {
            let mut table = self.inner.table.lock().await;
            let id = table.next_id(&new.task_type);
            table.insert(
                Task {
                    id: id.clone(),
                    name: new.name,
                    task_type: new.task_type,
                    priority,
                    status: TaskStatus::Pending,
                    created_at: now,
                    scheduled_at,
                    started_at: None,
                    completed_at: None,
                    duration: None,
                    retry_count: 0,
                    max_retries: new.max_retries.unwrap_or(self.inner.defaults.max_retries),
                    retry_delay_base: new.retry_delay.unwrap_or(self.inner.defaults.retry_delay),
                    timeout,
                    dependencies: new.dependencies.into_iter().collect(),
                    metadata: new.metadata,
                    args: new.args,
                    result: None,
                    error: None,
                    attempts: Vec::new(),
                    cancel_requested: false,
                },
                now,
            );
            id
        };

        tracing::info!("📅 Task created: {} (priority {})", id, priority);
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Submit configured seed tasks in order. Seed dependencies refer to
    /// earlier seeds by position.
    pub async fn submit_seeds(&self, seeds: &[SeedTask]) -> Result<Vec<TaskId>, ValidationError> {
        let mut ids: Vec<TaskId> = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let mut new = NewTask::new(&seed.name, &seed.task_type)
                .args(TaskArgs {
                    positional: seed.args.clone(),
                    keyword: seed.kwargs.clone(),
                })
                .delay(Duration::from_secs(seed.delay_secs));
            if let Some(raw) = &seed.priority {
                let priority = raw.parse().map_err(ValidationError::InvalidPriority)?;
                new = new.priority(priority);
            }
            if let Some(max_retries) = seed.max_retries {
                new = new.max_retries(max_retries);
            }
            if let Some(secs) = seed.timeout_secs {
                new = new.timeout(Duration::from_secs(secs));
            }
            for &index in &seed.depends_on {
                let dep = ids.get(index).ok_or_else(|| ValidationError::SeedDependency {
                    name: seed.name.clone(),
                    index,
                })?;
                new = new.depends_on(dep.clone());
            }
            ids.push(self.create_task(new).await?);
        }
        Ok(ids)
    }

    // ── Queries ────────────────────────────────────────────

    pub async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.inner.table.lock().await.get(id).cloned()
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.inner
            .table
            .lock()
            .await
            .select(|t| t.status == status)
    }

    pub async fn list_by_type(&self, task_type: &str) -> Vec<Task> {
        self.inner
            .table
            .lock()
            .await
            .select(|t| t.task_type == task_type)
    }

    /// Filtered page, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter, limit: usize, offset: usize) -> TaskPage {
        let matches = self.inner.table.lock().await.select(|t| filter.matches(t));
        TaskPage::from_matches(matches, limit, offset)
    }

    /// Task count for every status, zeros included.
    pub async fn status_summary(&self) -> BTreeMap<TaskStatus, usize> {
        let table = self.inner.table.lock().await;
        TaskStatus::ALL
            .iter()
            .map(|&status| (status, table.count_where(|t| t.status == status)))
            .collect()
    }

    /// Pending tasks that can never become ready.
    pub async fn stuck_tasks(&self) -> Vec<StuckTask> {
        self.inner.table.lock().await.stuck()
    }

    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let now = self.inner.clock.now();
        self.inner.table.lock().await.metrics(now)
    }

    pub async fn reset_metrics(&self) {
        let now = self.inner.clock.now();
        self.inner.table.lock().await.reset_metrics(now);
        tracing::info!("📊 Metrics reset");
    }

    /// Every transition applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    // ── Control ────────────────────────────────────────────

    /// Cancel a task. Pending and Queued tasks always cancel. A Running task
    /// is interrupted when its body allows it; otherwise the request is
    /// recorded, `false` is returned, and the eventual result is discarded.
    pub async fn cancel_task(&self, id: &TaskId) -> bool {
        let now = self.inner.clock.now();
        self.inner.table.lock().await.cancel(id, now)
    }

    /// Send a Failed task back to Pending with the usual backoff.
    pub async fn retry_task(&self, id: &TaskId) -> bool {
        let now = self.inner.clock.now();
        let retried = self.inner.table.lock().await.retry(id, now);
        if retried {
            self.inner.wake.notify_one();
        }
        retried
    }

    pub async fn delete_task(&self, id: &TaskId) -> bool {
        self.inner.table.lock().await.delete(id)
    }

    /// Apply one operation to many tasks under a single lock.
    pub async fn bulk(&self, operation: BulkOperation, selector: BulkSelector) -> BulkReport {
        let now = self.inner.clock.now();
        let mut report = BulkReport::new(operation);
        {
            let mut table = self.inner.table.lock().await;
            let ids = match selector {
                BulkSelector::Ids(ids) => ids,
                BulkSelector::Filter(filter) => table
                    .select(|t| filter.matches(t))
                    .into_iter()
                    .map(|t| t.id)
                    .collect(),
            };
            for id in &ids {
                let applied = match operation {
                    BulkOperation::Cancel => table.cancel(id, now),
                    BulkOperation::Retry => table.retry(id, now),
                    BulkOperation::Delete => table.delete(id),
                };
                report.record(id, applied);
            }
        }
        tracing::info!(
            "📦 Bulk {}: {}/{} applied",
            operation,
            report.successful,
            report.total
        );
        if operation == BulkOperation::Retry && report.successful > 0 {
            self.inner.wake.notify_one();
        }
        report
    }

    // ── Coordinating loop ──────────────────────────────────

    /// Run one promote-and-dispatch pass.
    ///
    /// The loop calls this on every wake-up; tests may drive it directly
    /// without starting the loop.
    pub async fn tick(&self) -> TickReport {
        let inner = &self.inner;
        let mut report = TickReport {
            reaped: inner.pool.reap().await,
            ..TickReport::default()
        };
        let now = inner.clock.now();
        let mut launches = Vec::new();

        {
            let registry = inner.registry.read().await;
            let mut table = inner.table.lock().await;
            report.promoted = table.promote_ready(now);

            while table.has_queued() {
                let Some(permit) = inner.pool.try_acquire() else {
                    break;
                };
                let Some(id) = table.pop_dispatchable() else {
                    break;
                };
                let Some(dispatch) = table.start(&id, now) else {
                    report.task_faults += 1;
                    continue;
                };
                let Some(executor) = registry.get(&dispatch.task_type) else {
                    tracing::error!("❌ No executor for {}; failing task", dispatch.id);
                    let error = ExecutionError::new(format!(
                        "no executor registered for '{}'",
                        dispatch.task_type
                    ));
                    table.finish(&id, Err(error), now);
                    report.task_faults += 1;
                    continue;
                };

                let interruptible = executor.interruptible();
                let args = dispatch.args.clone();
                let body = tokio::spawn(async move { executor.execute(args).await });
                table.attach(
                    id,
                    RunningHandle {
                        abort: body.abort_handle(),
                        interruptible,
                    },
                );
                tracing::info!(
                    "🚀 Dispatched {} (attempt {}, {}/{} workers busy)",
                    dispatch.id,
                    dispatch.attempt,
                    inner.pool.in_use(),
                    inner.pool.capacity()
                );
                report.dispatched += 1;
                launches.push((permit, dispatch, body));
            }
        }

        for (permit, dispatch, body) in launches {
            let worker = supervise(Arc::clone(inner), dispatch, body, permit);
            inner.pool.spawn(worker).await;
        }
        report
    }

    /// Start the coordinating loop. Returns false if it is already running.
    pub async fn start(&self) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            tracing::debug!("Orchestrator already running");
            return false;
        }
        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.clone(), signal));
        *lifecycle = Some(Lifecycle { shutdown, handle });
        tracing::info!(
            "⏰ Orchestrator started ({} workers, tick every {:?})",
            self.inner.pool.capacity(),
            self.inner.config.tick_interval()
        );
        true
    }

    /// Stop the loop and wait for in-flight workers up to the shutdown
    /// timeout. Returns false if workers had to be aborted.
    pub async fn stop(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock().await.take();
        if let Some(Lifecycle { shutdown, handle }) = lifecycle {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Coordinating loop ended abnormally: {e}");
            }
        }

        let timeout = self.inner.config.shutdown_timeout();
        let drained = self.inner.pool.drain(timeout).await;
        if !drained {
            let now = self.inner.clock.now();
            let cancelled = self.inner.table.lock().await.abort_running(now);
            let aborted = self.inner.pool.abort_all().await;
            tracing::warn!(
                "⚠️ Shutdown timeout ({:?}) hit: aborted {} worker(s), cancelled {} task(s)",
                timeout,
                aborted,
                cancelled
            );
        }
        tracing::info!("🛑 Orchestrator stopped");
        drained
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.is_some()
    }
}

/// Worker body: run one attempt under its timeout and record the outcome.
/// The slot is released only after the task has left Running.
async fn supervise(
    inner: Arc<Inner>,
    dispatch: Dispatch,
    body: JoinHandle<TaskOutput>,
    permit: OwnedSemaphorePermit,
) {
    let abort = body.abort_handle();
    let output = match tokio::time::timeout(dispatch.timeout, body).await {
        Ok(Ok(output)) => Some(output),
        // Interrupted by cancel or shutdown; the table already recorded it.
        Ok(Err(e)) if e.is_cancelled() => None,
        Ok(Err(e)) => Some(Err(ExecutionError::panicked(panic_message(e.into_panic())))),
        Err(_) => {
            abort.abort();
            tracing::warn!("⏱️ Task {} timed out after {:?}", dispatch.id, dispatch.timeout);
            Some(Err(ExecutionError::timeout(dispatch.timeout)))
        }
    };

    if let Some(output) = output {
        match inner.complete(&dispatch.id, output).await {
            Finished::Retrying { retry_count, delay } => tracing::debug!(
                "Task {} attempt {} failed, retry #{} due in {:?}",
                dispatch.id,
                dispatch.attempt,
                retry_count,
                delay
            ),
            finished => tracing::debug!(
                "Task {} attempt {} -> {:?}",
                dispatch.id,
                dispatch.attempt,
                finished
            ),
        }
    }
    drop(permit);
    inner.wake.notify_one();
}

async fn run_loop(orchestrator: Orchestrator, mut shutdown: watch::Receiver<bool>) {
    let config = orchestrator.inner.config.clone();
    let mut backoff = FaultBackoff::new(config.fault_backoff(), config.max_fault_backoff());

    loop {
        let outcome = AssertUnwindSafe(orchestrator.tick())
            .catch_unwind()
            .await
            .map_err(|payload| SchedulingFault::Panicked(panic_message(payload)));

        let pause = match outcome {
            Ok(report) => {
                if let Some(streak) = backoff.on_clean() {
                    tracing::info!("✅ Coordinating loop recovered after {} faulty tick(s)", streak);
                }
                if !report.is_idle() {
                    tracing::debug!("🔄 Tick: {:?}", report);
                }
                config.tick_interval()
            }
            Err(fault) => {
                let pause = backoff.on_fault();
                tracing::warn!(
                    "⚠️ Scheduling fault #{}: {}, backing off {:?}",
                    backoff.faults(),
                    fault,
                    pause
                );
                pause
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = orchestrator.inner.wake.notified(), if !backoff.is_faulting() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("⏹️ Coordinating loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::from_fn;
    use chrono::{TimeZone, Utc};

    fn orchestrator(workers: usize) -> (Orchestrator, Arc<ManualClock>) {
        let mut config = TasklaneConfig::default();
        config.scheduler.max_workers = workers;
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap(),
        ));
        (Orchestrator::with_clock(&config, clock.clone()), clock)
    }

    #[test]
    fn test_configured_default_priority() {
        let config = TasklaneConfig::from_toml("[defaults]\npriority = \"urgent\"").unwrap();
        let orch = Orchestrator::new(&config);
        assert_eq!(orch.defaults().priority, Priority::Urgent);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_submissions() {
        let (orch, _) = orchestrator(1);
        orch.register_task_type("echo", from_fn(|args: TaskArgs| async move {
            Ok(serde_json::json!(args.positional))
        }))
        .await
        .unwrap();

        assert_eq!(
            orch.create_task(NewTask::new("x", "nope")).await,
            Err(ValidationError::UnknownTaskType("nope".into()))
        );
        assert_eq!(
            orch.create_task(NewTask::new("  ", "echo")).await,
            Err(ValidationError::EmptyName)
        );
        assert_eq!(
            orch.create_task(NewTask::new("x", "echo").timeout(Duration::ZERO)).await,
            Err(ValidationError::ZeroTimeout)
        );
        assert!(matches!(
            orch.create_task(NewTask::new("x", "echo").scheduled_at_str("tomorrow-ish")).await,
            Err(ValidationError::InvalidSchedule { .. })
        ));
        assert_eq!(orch.get_metrics().await.total_tasks_created, 0);
    }

    #[tokio::test]
    async fn test_defaults_applied() {
        let (orch, _) = orchestrator(1);
        orch.register_task_type("echo", from_fn(|_| async { Ok(serde_json::Value::Null) }))
            .await
            .unwrap();
        let id = orch.create_task(NewTask::new("x", "echo")).await.unwrap();
        let task = orch.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_delay_base, Duration::from_secs(60));
        assert_eq!(task.timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_tick_dispatches_up_to_capacity() {
        let (orch, _) = orchestrator(2);
        orch.register_task_type(
            "wait",
            from_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(serde_json::Value::Null)
            }),
        )
        .await
        .unwrap();
        for n in 0..3 {
            orch.create_task(NewTask::new(format!("w{n}"), "wait")).await.unwrap();
        }

        let report = orch.tick().await;
        assert_eq!(report.promoted, 3);
        assert_eq!(report.dispatched, 2);
        assert_eq!(orch.list_by_status(TaskStatus::Running).await.len(), 2);
        assert_eq!(orch.list_by_status(TaskStatus::Queued).await.len(), 1);

        for task in orch.list_by_status(TaskStatus::Running).await {
            assert!(orch.cancel_task(&task.id).await);
        }
        assert!(orch.stop().await);
    }

    #[tokio::test]
    async fn test_seeds_resolve_dependencies_by_position() {
        let (orch, _) = orchestrator(1);
        orch.register_task_type("echo", from_fn(|_| async { Ok(serde_json::Value::Null) }))
            .await
            .unwrap();
        let config = TasklaneConfig::from_toml(
            r#"
[[tasks]]
name = "first"
task_type = "echo"

[[tasks]]
name = "second"
task_type = "echo"
priority = "high"
depends_on = [0]
"#,
        )
        .unwrap();

        let ids = orch.submit_seeds(&config.tasks).await.unwrap();
        assert_eq!(ids.len(), 2);
        let second = orch.get_task(&ids[1]).await.unwrap();
        assert_eq!(second.priority, Priority::High);
        assert!(second.dependencies.contains(&ids[0]));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (orch, _) = orchestrator(1);
        assert!(!orch.is_running().await);
        assert!(orch.start().await);
        assert!(!orch.start().await);
        assert!(orch.is_running().await);
        assert!(orch.stop().await);
        assert!(!orch.is_running().await);
        // Restartable after stop.
        assert!(orch.start().await);
        assert!(orch.stop().await);
    }
}
