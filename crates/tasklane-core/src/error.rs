//! Error types shared across Tasklane crates.

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, TasklaneError>;

/// Errors raised outside of task execution (config, I/O, serialization).
#[derive(Debug, thiserror::Error)]
pub enum TasklaneError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
