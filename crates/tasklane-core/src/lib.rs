//! # Tasklane Core
//!
//! Shared configuration and error types used by the scheduler crate and the
//! `tasklane` binary.

pub mod config;
pub mod error;

pub use config::{DefaultsConfig, SchedulerConfig, SeedTask, TasklaneConfig};
pub use error::{Result, TasklaneError};
