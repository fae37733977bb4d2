//! Executor registry: maps task-type ids to executable bodies.
//!
//! Bodies are validated at registration (well-formed type id) and looked up
//! at submission, so an unknown type is rejected before a task ever exists.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ExecutionError, ValidationError};
use crate::tasks::TaskArgs;

/// Tagged outcome of a task body.
pub type TaskOutput = Result<serde_json::Value, ExecutionError>;

/// An executable task body.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, args: TaskArgs) -> TaskOutput;

    /// Whether dropping the running future actually stops the work.
    /// Blocking bodies return false: cancellation and timeouts on them are
    /// best-effort.
    fn interruptible(&self) -> bool {
        true
    }
}

/// Async closure body.
pub struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    async fn execute(&self, args: TaskArgs) -> TaskOutput {
        (self.f)(args).await
    }
}

/// Wrap an async closure as an executor.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

/// Synchronous body run on the blocking thread pool.
pub struct BlockingExecutor<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> TaskExecutor for BlockingExecutor<F>
where
    F: Fn(TaskArgs) -> TaskOutput + Send + Sync + 'static,
{
    async fn execute(&self, args: TaskArgs) -> TaskOutput {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(args)).await {
            Ok(output) => output,
            Err(e) if e.is_panic() => Err(ExecutionError::panicked(panic_message(e.into_panic()))),
            Err(e) => Err(ExecutionError::new(format!("blocking body aborted: {e}"))),
        }
    }

    fn interruptible(&self) -> bool {
        false
    }
}

/// Wrap a blocking closure as an executor.
pub fn blocking<F>(f: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(TaskArgs) -> TaskOutput + Send + Sync + 'static,
{
    Arc::new(BlockingExecutor { f: Arc::new(f) })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Registry of task bodies keyed by type id.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the body for `type_id`.
    pub fn register(
        &mut self,
        type_id: &str,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), ValidationError> {
        validate_type_id(type_id)?;
        if self.executors.insert(type_id.to_string(), executor).is_some() {
            tracing::info!("🔁 Task type re-registered: {}", type_id);
        } else {
            tracing::info!("🧩 Registered task type: {}", type_id);
        }
        Ok(())
    }

    pub fn get(&self, type_id: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(type_id).cloned()
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.executors.contains_key(type_id)
    }

    /// Registered type ids, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

fn validate_type_id(type_id: &str) -> Result<(), ValidationError> {
    let well_formed = !type_id.is_empty()
        && type_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::InvalidTaskType(type_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ExecutorRegistry::new();
        reg.register("echo", from_fn(|args: TaskArgs| async move {
            Ok(serde_json::json!(args.positional))
        }))
        .unwrap();
        assert!(reg.contains("echo"));
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.types(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_rejects_malformed_type_ids() {
        let mut reg = ExecutorRegistry::new();
        let body = from_fn(|_args: TaskArgs| async { Ok(serde_json::Value::Null) });
        assert_eq!(
            reg.register("", body.clone()),
            Err(ValidationError::InvalidTaskType(String::new()))
        );
        assert!(reg.register("has space", body.clone()).is_err());
        assert!(reg.register("report.daily-v2", body).is_ok());
    }

    #[tokio::test]
    async fn test_blocking_executor_runs_and_reports_panics() {
        let ok = blocking(|args: TaskArgs| Ok(serde_json::json!(args.positional.len())));
        assert!(!ok.interruptible());
        let out = ok
            .execute(TaskArgs {
                positional: vec![serde_json::json!(1), serde_json::json!(2)],
                ..TaskArgs::default()
            })
            .await;
        assert_eq!(out, Ok(serde_json::json!(2)));

        let boom = blocking(|_args: TaskArgs| -> TaskOutput { panic!("disk on fire") });
        let err = boom.execute(TaskArgs::default()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Panicked);
        assert!(err.message.contains("disk on fire"));
    }
}
