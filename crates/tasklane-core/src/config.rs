//! Tasklane configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TasklaneError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasklaneConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Tasks submitted by the binary right after startup.
    #[serde(default)]
    pub tasks: Vec<SeedTask>,
}

impl TasklaneConfig {
    /// Load config from the default path (~/.tasklane/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!("📂 Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| TasklaneError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TasklaneError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TasklaneError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_workers == 0 {
            return Err(TasklaneError::Config(
                "scheduler.max_workers must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(TasklaneError::Config(
                "scheduler.tick_interval_ms must be positive".into(),
            ));
        }
        if self.defaults.timeout_secs == 0 {
            return Err(TasklaneError::Config(
                "defaults.timeout_secs must be positive".into(),
            ));
        }
        if !is_priority(&self.defaults.priority) {
            return Err(TasklaneError::Config(format!(
                "defaults.priority '{}' is not one of {}",
                self.defaults.priority,
                PRIORITY_LABELS.join(", ")
            )));
        }
        for (idx, seed) in self.tasks.iter().enumerate() {
            if let Some(priority) = seed.priority.as_deref()
                && !is_priority(priority)
            {
                return Err(TasklaneError::Config(format!(
                    "tasks[{idx}] ('{}') has unknown priority '{priority}'",
                    seed.name
                )));
            }
            if let Some(bad) = seed.depends_on.iter().find(|dep| **dep >= idx) {
                return Err(TasklaneError::Config(format!(
                    "tasks[{idx}] ('{}') depends on tasks[{bad}], which is not declared before it",
                    seed.name
                )));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Tasklane home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tasklane")
    }

    /// Expand `~` in a user-supplied path.
    pub fn expand_path(p: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(p).to_string())
    }
}

/// Priority names accepted in config, lowest first. Levels 1-5 are accepted too.
pub const PRIORITY_LABELS: [&str; 5] = ["low", "normal", "high", "urgent", "critical"];

fn is_priority(raw: &str) -> bool {
    let raw = raw.trim().to_lowercase();
    PRIORITY_LABELS.contains(&raw.as_str())
        || matches!(raw.parse::<u8>(), Ok(level) if (1..=5).contains(&level))
}

/// Coordinating loop and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Base sleep after a faulty tick; doubles on each consecutive fault.
    #[serde(default = "default_fault_backoff_ms")]
    pub fault_backoff_ms: u64,
    #[serde(default = "default_max_fault_backoff_ms")]
    pub max_fault_backoff_ms: u64,
    /// How long `stop()` waits for in-flight workers before aborting them.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Capacity of the transition event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_workers() -> usize { 5 }
fn default_tick_interval_ms() -> u64 { 1000 }
fn default_fault_backoff_ms() -> u64 { 5000 }
fn default_max_fault_backoff_ms() -> u64 { 60_000 }
fn default_shutdown_timeout_secs() -> u64 { 10 }
fn default_event_buffer() -> usize { 256 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            tick_interval_ms: default_tick_interval_ms(),
            fault_backoff_ms: default_fault_backoff_ms(),
            max_fault_backoff_ms: default_max_fault_backoff_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn fault_backoff(&self) -> Duration {
        Duration::from_millis(self.fault_backoff_ms)
    }

    pub fn max_fault_backoff(&self) -> Duration {
        Duration::from_millis(self.max_fault_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Per-task policy applied when a submission leaves a field unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_max_retries() -> u32 { 3 }
fn default_retry_delay_secs() -> u64 { 60 }
fn default_max_retry_delay_secs() -> u64 { 3600 }
fn default_timeout_secs() -> u64 { 300 }
fn default_priority() -> String { "normal".into() }

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            timeout_secs: default_timeout_secs(),
            priority: default_priority(),
        }
    }
}

impl DefaultsConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A task declared in the config file and submitted at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedTask {
    pub name: String,
    pub task_type: String,
    #[serde(default)]
    pub priority: Option<String>,
    /// Delay before the task becomes eligible.
    #[serde(default)]
    pub delay_secs: u64,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Indices of earlier entries in `tasks` this one waits for.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TasklaneConfig::from_toml("").unwrap();
        assert_eq!(config.scheduler.max_workers, 5);
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.defaults.max_retries, 3);
        assert_eq!(config.defaults.retry_delay(), Duration::from_secs(60));
        assert_eq!(config.defaults.timeout(), Duration::from_secs(300));
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn test_parse_seed_tasks() {
        let config = TasklaneConfig::from_toml(
            r#"
            [scheduler]
            max_workers = 2

            [[tasks]]
            name = "Nightly health"
            task_type = "health_check"
            priority = "high"

            [[tasks]]
            name = "Report"
            task_type = "echo"
            delay_secs = 30
            args = ["daily"]
            depends_on = [0]
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_workers, 2);
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].priority.as_deref(), Some("high"));
        assert_eq!(config.tasks[1].depends_on, vec![0]);
        assert_eq!(config.tasks[1].args[0], serde_json::json!("daily"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = TasklaneConfig::from_toml("[scheduler]\nmax_workers = 0").unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[test]
    fn test_rejects_unknown_priorities() {
        let err = TasklaneConfig::from_toml("[defaults]\npriority = \"asap\"").unwrap_err();
        assert!(err.to_string().contains("defaults.priority"));

        let err = TasklaneConfig::from_toml(
            r#"
            [[tasks]]
            name = "a"
            task_type = "echo"
            priority = "7"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tasks[0]"));

        let config = TasklaneConfig::from_toml("[defaults]\npriority = \" Critical \"").unwrap();
        assert_eq!(config.defaults.priority.trim(), "Critical");
        assert!(TasklaneConfig::from_toml("[defaults]\npriority = \"4\"").is_ok());
    }

    #[test]
    fn test_rejects_forward_seed_dependency() {
        let err = TasklaneConfig::from_toml(
            r#"
            [[tasks]]
            name = "a"
            task_type = "echo"
            depends_on = [1]

            [[tasks]]
            name = "b"
            task_type = "echo"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tasks[0]"));
    }

    #[test]
    fn test_toml_roundtrip_keeps_scheduler_section() {
        let mut config = TasklaneConfig::default();
        config.scheduler.max_workers = 9;
        let text = config.to_toml().unwrap();
        let back = TasklaneConfig::from_toml(&text).unwrap();
        assert_eq!(back.scheduler.max_workers, 9);
    }
}
