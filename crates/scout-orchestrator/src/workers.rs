//! Simple worker backends.

use async_trait::async_trait;
use scout_abstraction::{ExecutionError, WorkOrder, WorkOutcome, WorkerBackend};
use std::time::Duration;

/// A worker backend that echoes the payload back after an optional delay.
///
/// Useful for wiring tests and local experimentation without a real
/// inference endpoint.
#[derive(Debug, Clone, Default)]
pub struct EchoWorker {
    /// Simulated execution latency.
    delay: Option<Duration>,
}

impl EchoWorker {
    /// Creates an echo worker that responds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self { delay: None }
    }

    /// Creates an echo worker with simulated latency.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl WorkerBackend for EchoWorker {
    async fn execute(
        &self,
        model_id: &str,
        order: WorkOrder,
    ) -> Result<WorkOutcome, ExecutionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(WorkOutcome { output: order.payload, worker_id: Some(model_id.to_string()) })
    }
}
