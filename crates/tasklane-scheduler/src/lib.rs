//! # Tasklane Scheduler
//!
//! In-process task orchestrator: priority dispatch, dependency ordering,
//! a bounded worker pool, retry with exponential backoff, and metrics.
//!
//! ## Design Principles
//! - One explicit [`Orchestrator`] handle per instance, no globals
//! - One async mutex over the task table; no lock held while a body runs
//! - Tokio timers only, zero overhead when idle
//! - Bodies looked up in an explicit registry, checked at submission
//!
//! ## Architecture
//! ```text
//! create_task ──► Pending ──(due + deps Completed)──► Queued
//!                                                      │
//! Coordinating loop (tick interval, woken early)       │ priority, then FIFO
//!   ├── promote ready Pending tasks                    ▼
//!   ├── dispatch while a worker slot is free ──► Running (own tokio task)
//!   └── reap finished workers                          │  under timeout
//!                                                      ▼
//!              Completed ──► promote dependents   Failed ──► Retrying ──► Pending
//!                                                  (base × 2^(n−1), capped)
//! ```

pub mod builtin;
pub mod clock;
pub mod deps;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod queue;
pub mod registry;
pub mod retry;
mod table;
pub mod tasks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use deps::StuckTask;
pub use engine::{Orchestrator, TaskDefaults, TickReport};
pub use error::{ExecutionError, FailureKind, SchedulingFault, TransitionError, ValidationError};
pub use events::TaskEvent;
pub use metrics::MetricsSnapshot;
pub use query::{BulkOperation, BulkReport, BulkSelector, TaskFilter, TaskPage};
pub use registry::{TaskExecutor, TaskOutput, blocking, from_fn};
pub use tasks::{NewTask, Priority, Schedule, Task, TaskArgs, TaskId, TaskStatus};
