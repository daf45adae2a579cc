// Error types for the orchestrator

use crate::config::ConfigError;
use crate::quota::QuotaError;
use crate::registry::RegistryError;
use crate::router::RoutingError;
use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No task with this id is known to the scheduler
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A state change violated the task lifecycle
    #[error("Invalid task transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state
        from: TaskStatus,
        /// Requested state
        to: TaskStatus,
    },

    /// The scheduling loop is already running
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// The scheduling loop is not running
    #[error("Scheduler is not running")]
    NotRunning,

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Quota error
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    /// Routing error
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
