//! Metrics aggregator: running counters updated at each transition.
//!
//! Counters live inside the task table and are mutated under the same lock as
//! the transitions they count, so a snapshot never runs ahead of or behind
//! the task states it describes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct Metrics {
    created: u64,
    completed: u64,
    failed: u64,
    failed_attempts: u64,
    retries: u64,
    cancelled: u64,
    total_execution: Duration,
    last_reset: DateTime<Utc>,
}

/// Live counts computed from the task table at snapshot time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub active: usize,
    pub queued: usize,
    pub total: usize,
}

/// Read-only view for external reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_tasks_created: u64,
    pub total_tasks_completed: u64,
    /// Tasks that ended Failed with no automatic retry.
    pub total_tasks_failed: u64,
    /// Every Running → Failed transition, retried or not.
    pub failed_attempts: u64,
    pub total_retries: u64,
    pub total_tasks_cancelled: u64,
    pub total_execution_secs: f64,
    pub average_execution_secs: f64,
    pub tasks_per_minute: f64,
    /// completed / created × 100.
    pub success_rate: f64,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub total_tasks: usize,
    pub last_reset: DateTime<Utc>,
}

impl Metrics {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created: 0,
            completed: 0,
            failed: 0,
            failed_attempts: 0,
            retries: 0,
            cancelled: 0,
            total_execution: Duration::ZERO,
            last_reset: now,
        }
    }

    pub fn record_created(&mut self) {
        self.created += 1;
    }

    pub fn record_completed(&mut self, execution: Duration) {
        self.completed += 1;
        self.total_execution += execution;
    }

    pub fn record_failed_attempt(&mut self, execution: Duration) {
        self.failed_attempts += 1;
        self.total_execution += execution;
    }

    pub fn record_terminal_failure(&mut self) {
        self.failed += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_cancelled(&mut self) {
        self.cancelled += 1;
    }

    /// Zero all counters and restart the throughput window.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        *self = Self::new(now);
    }

    pub fn snapshot(&self, now: DateTime<Utc>, gauges: Gauges) -> MetricsSnapshot {
        let elapsed = (now - self.last_reset).num_milliseconds() as f64 / 1000.0;
        let tasks_per_minute = if elapsed > 0.0 {
            self.completed as f64 / elapsed * 60.0
        } else {
            0.0
        };
        let executions = self.completed + self.failed_attempts;
        let total_execution_secs = self.total_execution.as_secs_f64();
        let average_execution_secs = if executions > 0 {
            total_execution_secs / executions as f64
        } else {
            0.0
        };
        MetricsSnapshot {
            total_tasks_created: self.created,
            total_tasks_completed: self.completed,
            total_tasks_failed: self.failed,
            failed_attempts: self.failed_attempts,
            total_retries: self.retries,
            total_tasks_cancelled: self.cancelled,
            total_execution_secs,
            average_execution_secs,
            tasks_per_minute,
            success_rate: self.completed as f64 / self.created.max(1) as f64 * 100.0,
            active_tasks: gauges.active,
            queued_tasks: gauges.queued,
            total_tasks: gauges.total,
            last_reset: self.last_reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_math() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut m = Metrics::new(start);
        for _ in 0..4 {
            m.record_created();
        }
        m.record_completed(Duration::from_secs(2));
        m.record_completed(Duration::from_secs(4));
        m.record_failed_attempt(Duration::from_secs(3));
        m.record_terminal_failure();

        let snap = m.snapshot(start + chrono::Duration::minutes(2), Gauges::default());
        assert_eq!(snap.total_tasks_created, 4);
        assert_eq!(snap.total_tasks_completed, 2);
        assert_eq!(snap.total_tasks_failed, 1);
        assert_eq!(snap.average_execution_secs, 3.0);
        assert_eq!(snap.tasks_per_minute, 1.0);
        assert_eq!(snap.success_rate, 50.0);
    }

    #[test]
    fn test_empty_snapshot_has_no_nan() {
        let now = Utc::now();
        let snap = Metrics::new(now).snapshot(now, Gauges::default());
        assert_eq!(snap.tasks_per_minute, 0.0);
        assert_eq!(snap.average_execution_secs, 0.0);
        assert_eq!(snap.success_rate, 0.0);
    }

    #[test]
    fn test_reset_restarts_window() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut m = Metrics::new(start);
        m.record_created();
        m.record_completed(Duration::from_secs(1));
        let later = start + chrono::Duration::hours(1);
        m.reset(later);
        let snap = m.snapshot(later, Gauges::default());
        assert_eq!(snap.total_tasks_completed, 0);
        assert_eq!(snap.last_reset, later);
    }
}
