#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tasklane_core::TasklaneConfig;
use tasklane_scheduler::{ManualClock, Orchestrator, Task, TaskId};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
}

/// Orchestrator on a frozen manual clock with a fast tick.
pub fn orchestrator(workers: usize) -> (Orchestrator, Arc<ManualClock>) {
    let mut config = TasklaneConfig::default();
    config.scheduler.max_workers = workers;
    config.scheduler.tick_interval_ms = 10;
    config.scheduler.shutdown_timeout_secs = 2;
    let clock = Arc::new(ManualClock::new(t0()));
    (Orchestrator::with_clock(&config, clock.clone()), clock)
}

/// Poll until `pred` holds for the task, or panic after five seconds.
pub async fn wait_for(orch: &Orchestrator, id: &TaskId, pred: impl Fn(&Task) -> bool) -> Task {
    let poll = async {
        loop {
            if let Some(task) = orch.get_task(id).await
                && pred(&task)
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("task {id} never reached the expected state"))
}

/// Wait until every task in `ids` is terminal.
pub async fn wait_settled(orch: &Orchestrator, ids: &[TaskId]) -> Vec<Task> {
    let mut settled = Vec::with_capacity(ids.len());
    for id in ids {
        settled.push(wait_for(orch, id, Task::is_terminal).await);
    }
    settled
}
