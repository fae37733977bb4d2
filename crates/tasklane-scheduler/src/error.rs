//! Error taxonomy for the orchestrator.
//!
//! - [`ValidationError`]: bad submission, returned synchronously, never retried.
//! - [`ExecutionError`]: a task body failed; stored on the task and drives retry.
//! - [`SchedulingFault`]: the coordinating loop itself misbehaved during a tick.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tasks::{TaskId, TaskStatus};

/// Rejected submission or registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("invalid task type id '{0}': use letters, digits, '_', '-' or '.'")]
    InvalidTaskType(String),

    #[error("invalid schedule time '{value}': {reason}")]
    InvalidSchedule { value: String, reason: String },

    #[error("task name must not be empty")]
    EmptyName,

    #[error("task timeout must be greater than zero")]
    ZeroTimeout,

    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    #[error("seed task '{name}' depends on seed #{index}, which is not submitted before it")]
    SeedDependency { name: String, index: usize },
}

/// Why a body failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The body returned an error.
    Error,
    /// The body exceeded its timeout.
    Timeout,
    /// The body panicked.
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error => write!(f, "error"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Panicked => write!(f, "panicked"),
        }
    }
}

/// Failure reported by (or on behalf of) a task body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("exceeded timeout of {limit:?}"),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panicked,
            message: message.into(),
        }
    }
}

impl From<String> for ExecutionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ExecutionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// An edge outside the lifecycle graph was requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for task {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Fault inside the coordinating loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingFault {
    #[error("tick panicked: {0}")]
    Panicked(String),
}
