//! Task definitions: the core data model for scheduled work.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TransitionError, ValidationError};

/// Unique task identity: the task type plus its submission sequence number.
///
/// Rendered as `"{task_type}_{seq}"`. The sequence is assigned by the
/// orchestrator and never reused, so it doubles as the FIFO tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    task_type: String,
    seq: u64,
}

impl TaskId {
    pub fn new(task_type: impl Into<String>, seq: u64) -> Self {
        Self {
            task_type: task_type.into(),
            seq,
        }
    }

    /// Submission sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq
            .cmp(&other.seq)
            .then_with(|| self.task_type.cmp(&other.task_type))
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.task_type, self.seq)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (task_type, seq) = s
            .rsplit_once('_')
            .ok_or_else(|| format!("task id '{s}' has no sequence suffix"))?;
        if task_type.is_empty() {
            return Err(format!("task id '{s}' has an empty task type"));
        }
        let seq = seq
            .parse()
            .map_err(|_| format!("task id '{s}' has a non-numeric sequence"))?;
        Ok(Self::new(task_type, seq))
    }
}

/// Task priority, five levels. Higher levels dispatch first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Urgent,
        Priority::Critical,
    ];

    pub fn as_label(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "1" => Ok(Priority::Low),
            "normal" | "2" => Ok(Priority::Normal),
            "high" | "3" => Ok(Priority::High),
            "urgent" | "4" => Ok(Priority::Urgent),
            "critical" | "5" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Task lifecycle state.
///
/// ```text
/// Pending ──► Queued ──► Running ──► Completed
///    │          │           │
///    │          │           ├──► Failed ──► Retrying ──► Pending
///    ▼          ▼           ▼
/// Cancelled ◄───┴───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Retrying,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether `self -> target` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Retrying)
                | (Retrying, Pending)
        )
    }

    /// Not yet handed to a worker; cancellation always succeeds.
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Queued)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_label() == wanted)
            .ok_or_else(|| format!("invalid status '{s}'"))
    }
}

/// Positional and keyword arguments handed to the task body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub positional: Vec<serde_json::Value>,
    #[serde(default)]
    pub keyword: serde_json::Map<String, serde_json::Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&serde_json::Value> {
        self.positional.get(index)
    }

    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&serde_json::Value> {
        self.keyword.get(name)
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A unit of work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Human-readable name.
    pub name: String,
    /// Key into the executor registry.
    pub task_type: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may be promoted.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time of the last attempt (completed_at − started_at).
    pub duration: Option<Duration>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_delay_base: Duration,
    pub timeout: Duration,
    pub dependencies: BTreeSet<TaskId>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub args: TaskArgs,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: Vec<Attempt>,
    /// Cancellation was requested while a non-interruptible body was running.
    pub cancel_requested: bool,
}

impl Task {
    /// Failed with no automatic or manual retry left, Completed, or Cancelled.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.retry_count >= self.max_retries,
            _ => false,
        }
    }

    /// Schedule time has elapsed.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Move along a lifecycle edge, returning the previous status.
    pub(crate) fn transition_to(&mut self, target: TaskStatus) -> Result<TaskStatus, TransitionError> {
        let from = self.status;
        if !from.can_transition_to(target) {
            return Err(TransitionError {
                id: self.id.clone(),
                from,
                to: target,
            });
        }
        self.status = target;
        Ok(from)
    }

    /// Close the open attempt record, if any.
    pub(crate) fn finish_attempt(&mut self, now: DateTime<Utc>, error: Option<String>) {
        if let Some(attempt) = self.attempts.last_mut()
            && attempt.finished_at.is_none()
        {
            attempt.finished_at = Some(now);
            attempt.error = error;
        }
    }
}

/// When a submitted task becomes eligible.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    At(DateTime<Utc>),
    /// Relative to submission time.
    After(Duration),
    /// RFC 3339 timestamp supplied by an external caller.
    Rfc3339(String),
}

impl Schedule {
    pub(crate) fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
        match self {
            Schedule::At(at) => Ok(*at),
            Schedule::After(delay) => {
                let delay = chrono::Duration::from_std(*delay).map_err(|e| {
                    ValidationError::InvalidSchedule {
                        value: format!("{delay:?}"),
                        reason: e.to_string(),
                    }
                })?;
                now.checked_add_signed(delay)
                    .ok_or_else(|| ValidationError::InvalidSchedule {
                        value: format!("{delay}"),
                        reason: "schedule time out of range".into(),
                    })
            }
            Schedule::Rfc3339(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| ValidationError::InvalidSchedule {
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }
}

/// A task submission. Unset fields fall back to the orchestrator defaults.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub task_type: String,
    pub args: TaskArgs,
    pub priority: Option<Priority>,
    pub schedule: Option<Schedule>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub dependencies: Vec<TaskId>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            args: TaskArgs::default(),
            priority: None,
            schedule: None,
            max_retries: None,
            retry_delay: None,
            timeout: None,
            dependencies: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.keyword.insert(key.into(), value.into());
        self
    }

    pub fn args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Some(Schedule::At(at));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.schedule = Some(Schedule::After(delay));
        self
    }

    pub fn scheduled_at_str(mut self, raw: impl Into<String>) -> Self {
        self.schedule = Some(Schedule::Rfc3339(raw.into()));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_delay(mut self, base: Duration) -> Self {
        self.retry_delay = Some(base);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.push(id);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Bare task for unit tests.
#[cfg(test)]
pub(crate) fn fixture(task_type: &str, seq: u64, priority: Priority, status: TaskStatus) -> Task {
    let now = Utc::now();
    Task {
        id: TaskId::new(task_type, seq),
        name: format!("{task_type} #{seq}"),
        task_type: task_type.into(),
        priority,
        status,
        created_at: now,
        scheduled_at: now,
        started_at: None,
        completed_at: None,
        duration: None,
        retry_count: 0,
        max_retries: 3,
        retry_delay_base: Duration::from_secs(60),
        timeout: Duration::from_secs(300),
        dependencies: BTreeSet::new(),
        metadata: BTreeMap::new(),
        args: TaskArgs::default(),
        result: None,
        error: None,
        attempts: Vec::new(),
        cancel_requested: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_task_id_display_and_parse() {
        let id = TaskId::new("process_messages", 42);
        assert_eq!(id.to_string(), "process_messages_42");
        let parsed: TaskId = "process_messages_42".parse().unwrap();
        assert_eq!(parsed, id);
        assert!("nosuffix".parse::<TaskId>().is_err());
        assert!("type_abc".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_task_id_orders_by_sequence() {
        let a = TaskId::new("zeta", 1);
        let b = TaskId::new("alpha", 2);
        assert!(a < b);
    }

    #[test]
    fn test_priority_order_and_parse() {
        assert!(Priority::Critical > Priority::Urgent);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("5".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("whenever".parse::<Priority>().is_err());
    }

    #[test]
    fn test_lifecycle_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_every_state_has_a_label_that_parses_back() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_label().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_schedule_resolution() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let after = Schedule::After(Duration::from_secs(90)).resolve(now).unwrap();
        assert_eq!(after, now + chrono::Duration::seconds(90));

        let parsed = Schedule::Rfc3339("2026-03-01T13:00:00Z".into())
            .resolve(now)
            .unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap());

        let err = Schedule::Rfc3339("tomorrow-ish".into()).resolve(now).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_new_task_builder() {
        let spec = NewTask::new("Cycle", "automation_cycle")
            .kwarg("account_id", 7)
            .arg("full")
            .priority(Priority::High)
            .max_retries(1)
            .metadata("requested_by", "api");
        assert_eq!(spec.args.kwarg("account_id"), Some(&serde_json::json!(7)));
        assert_eq!(spec.args.arg(0), Some(&serde_json::json!("full")));
        assert_eq!(spec.priority, Some(Priority::High));
        assert_eq!(spec.max_retries, Some(1));
        assert_eq!(spec.metadata["requested_by"], serde_json::json!("api"));
    }
}
