//! Built-in task types, available to every orchestrator that asks for them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::engine::Orchestrator;
use crate::error::{ExecutionError, ValidationError};
use crate::registry::{TaskExecutor, TaskOutput, from_fn};
use crate::tasks::TaskArgs;

pub const HEALTH_CHECK: &str = "health_check";
pub const ECHO: &str = "echo";
pub const SLEEP: &str = "sleep";

/// Register the 3 built-in task types.
pub async fn register_defaults(orchestrator: &Orchestrator) -> Result<(), ValidationError> {
    for (type_id, executor) in builtin_types() {
        orchestrator.register_task_type(type_id, executor).await?;
    }
    Ok(())
}

fn builtin_types() -> Vec<(&'static str, Arc<dyn TaskExecutor>)> {
    vec![
        (HEALTH_CHECK, from_fn(|_| async { health_check() })),
        (ECHO, from_fn(|args| async move { echo(args) })),
        (SLEEP, from_fn(sleep)),
    ]
}

fn health_check() -> TaskOutput {
    Ok(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn echo(args: TaskArgs) -> TaskOutput {
    Ok(json!({
        "args": args.positional,
        "kwargs": args.keyword,
    }))
}

/// Sleeps for the `ms` keyword argument (milliseconds, default 0).
async fn sleep(args: TaskArgs) -> TaskOutput {
    let ms = match args.kwarg("ms") {
        None => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| {
                ExecutionError::new(format!("'ms' must be a non-negative integer, got {value}"))
            })?,
    };
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!({ "slept_ms": ms }))
}
