//! Worker abstraction layer for Scout.
//!
//! This module defines the core trait and types for dispatching work to AI
//! worker models. The orchestrator treats model execution as an external
//! collaborator behind the [`WorkerBackend`] trait; implementations may call
//! an inference endpoint, a local process, or a test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur when executing work against a model.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionError {
    /// An error occurred while reaching the worker (e.g., network issues).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The worker returned an error for this unit of work.
    #[error("Worker Response Error: {0}")]
    WorkerResponseError(String),

    /// The worker rejected the request because it is overloaded or throttled.
    #[error("Worker '{worker}' throttled{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Throttled {
        /// The worker model identifier.
        worker: String,
        /// Optional detail from the worker.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The work payload was malformed and can never succeed on any worker.
    #[error("Invalid Payload: {0}")]
    InvalidPayload(String),

    /// Execution was cancelled before the worker produced a result.
    #[error("Execution cancelled")]
    Cancelled,

    /// Other unexpected errors.
    #[error("Other Execution Error: {0}")]
    Other(String),
}

impl ExecutionError {
    /// Returns `true` if retrying the same work on another worker could
    /// plausibly succeed.
    ///
    /// Malformed payloads and cancellations are terminal: no amount of
    /// rerouting changes the outcome.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestError(_)
            | Self::WorkerResponseError(_)
            | Self::Throttled { .. }
            | Self::Other(_) => true,
            Self::InvalidPayload(_) | Self::Cancelled => false,
        }
    }
}

/// A single unit of work handed to a worker model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    /// Identifier of the owning task, for correlation in worker logs.
    pub task_id: String,
    /// The capability tag this work requires (e.g., "code-review").
    pub specialty: String,
    /// Opaque work payload, interpreted by the worker.
    pub payload: serde_json::Value,
}

impl WorkOrder {
    /// Creates a new work order.
    #[must_use]
    pub fn new(task_id: String, specialty: String, payload: serde_json::Value) -> Self {
        Self { task_id, specialty, payload }
    }
}

/// The result produced by a worker for one work order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOutcome {
    /// Output produced by the worker.
    pub output: serde_json::Value,
    /// Optional: the worker's own identifier echoed back.
    pub worker_id: Option<String>,
}

impl WorkOutcome {
    /// Creates an outcome with the given output and no worker attribution.
    #[must_use]
    pub fn new(output: serde_json::Value) -> Self {
        Self { output, worker_id: None }
    }
}

/// A trait that defines the interface to worker model execution.
///
/// Implementations must be safe to call concurrently for different workers;
/// the orchestrator provides its own per-model serialization where required.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Executes one work order against the named worker model.
    ///
    /// # Arguments
    /// * `model_id` - The worker model to execute against
    /// * `order` - The unit of work
    ///
    /// # Errors
    /// Returns an `ExecutionError` if the worker fails or rejects the work.
    async fn execute(
        &self,
        model_id: &str,
        order: WorkOrder,
    ) -> std::result::Result<WorkOutcome, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExecutionError::RequestError("timeout".to_string()).is_transient());
        assert!(
            ExecutionError::Throttled { worker: "m1".to_string(), message: None }.is_transient()
        );
        assert!(!ExecutionError::InvalidPayload("bad json".to_string()).is_transient());
        assert!(!ExecutionError::Cancelled.is_transient());
    }

    #[test]
    fn test_throttled_display() {
        let err = ExecutionError::Throttled {
            worker: "m1".to_string(),
            message: Some("slow down".to_string()),
        };
        assert_eq!(err.to_string(), "Worker 'm1' throttled: slow down");

        let bare = ExecutionError::Throttled { worker: "m1".to_string(), message: None };
        assert_eq!(bare.to_string(), "Worker 'm1' throttled");
    }

    #[test]
    fn test_work_order_roundtrip() {
        let order = WorkOrder::new(
            "task-1".to_string(),
            "summarize".to_string(),
            serde_json::json!({"text": "hello"}),
        );
        let json = serde_json::to_string(&order).unwrap();
        let back: WorkOrder = serde_json::from_str(&json).unwrap();
        assert_eq!(order, back);
    }
}
