//! Status event feed for the orchestrator.
//!
//! Internally all state changes are pushed onto a broadcast feed; polling
//! snapshots exist only as the outermost collaborator-facing convenience.

use crate::task::TaskId;
use crate::workflow::{StepStatus, WorkflowId};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Orchestrator status events.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A task entered the dispatch queue.
    TaskQueued {
        /// Task ID.
        task_id: TaskId,
    },
    /// A task was dispatched to a worker model.
    TaskStarted {
        /// Task ID.
        task_id: TaskId,
        /// Assigned model.
        model_id: String,
    },
    /// A task completed successfully.
    TaskCompleted {
        /// Task ID.
        task_id: TaskId,
        /// The model that executed it.
        model_id: String,
        /// Observed execution latency in milliseconds.
        latency_ms: u64,
    },
    /// A task attempt failed and the task was requeued for another model.
    TaskRequeued {
        /// Task ID.
        task_id: TaskId,
        /// The model that failed.
        failed_model: String,
        /// Attempts made so far.
        attempts: u32,
    },
    /// A task ended in terminal failure.
    TaskFailed {
        /// Task ID.
        task_id: TaskId,
        /// Failure description.
        reason: String,
    },
    /// Every tier was exhausted for a task; it stays queued with backoff.
    /// This is a warning, not a failure.
    Backpressure {
        /// Task ID.
        task_id: TaskId,
        /// The specialty that could not be routed.
        specialty: String,
    },
    /// A workflow step changed state.
    StepTransitioned {
        /// Workflow ID.
        workflow_id: WorkflowId,
        /// Step id within the workflow.
        step_id: String,
        /// New step status.
        status: StepStatus,
    },
    /// A workflow reached a terminal status.
    WorkflowFinished {
        /// Workflow ID.
        workflow_id: WorkflowId,
        /// `true` if every step completed.
        completed: bool,
    },
}

/// Aggregate scheduler metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    /// Tasks currently queued.
    pub queued: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Tasks completed since startup.
    pub completed: u64,
    /// Tasks failed terminally since startup.
    pub failed: u64,
    /// Retry reassignments since startup.
    pub retried: u64,
    /// Backpressure rounds since startup.
    pub backpressure_events: u64,
}

/// Broadcast reporter for orchestrator status.
pub struct StatusReporter {
    /// Broadcast sender for status events.
    broadcast_tx: broadcast::Sender<OrchestratorEvent>,
    /// Current metrics.
    metrics: Arc<Mutex<SchedulerMetrics>>,
}

impl StatusReporter {
    /// Creates a new reporter.
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        Self { broadcast_tx, metrics: Arc::new(Mutex::new(SchedulerMetrics::default())) }
    }

    /// Subscribes to status events.
    ///
    /// # Returns
    /// Returns a receiver for status events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Gets the current metrics snapshot.
    pub async fn snapshot(&self) -> SchedulerMetrics {
        self.metrics.lock().await.clone()
    }

    fn emit(&self, event: OrchestratorEvent) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.broadcast_tx.send(event.clone());
        debug!("Status event: {:?}", event);
    }

    /// Emits a task queued event.
    pub async fn task_queued(&self, task_id: TaskId) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.queued += 1;
        }
        self.emit(OrchestratorEvent::TaskQueued { task_id });
    }

    /// Emits a task started event.
    pub async fn task_started(&self, task_id: TaskId, model_id: String) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.queued = metrics.queued.saturating_sub(1);
            metrics.running += 1;
        }
        self.emit(OrchestratorEvent::TaskStarted { task_id, model_id });
    }

    /// Emits a task completed event.
    pub async fn task_completed(&self, task_id: TaskId, model_id: String, latency_ms: u64) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.running = metrics.running.saturating_sub(1);
            metrics.completed += 1;
        }
        self.emit(OrchestratorEvent::TaskCompleted { task_id, model_id, latency_ms });
    }

    /// Emits a task requeued event after a failed attempt.
    pub async fn task_requeued(&self, task_id: TaskId, failed_model: String, attempts: u32) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.running = metrics.running.saturating_sub(1);
            metrics.queued += 1;
            metrics.retried += 1;
        }
        self.emit(OrchestratorEvent::TaskRequeued { task_id, failed_model, attempts });
    }

    /// Emits a terminal task failure event.
    ///
    /// # Arguments
    /// * `task_id` - Task ID
    /// * `reason` - Failure description
    /// * `was_running` - Whether the task held a running slot
    pub async fn task_failed(&self, task_id: TaskId, reason: String, was_running: bool) {
        {
            let mut metrics = self.metrics.lock().await;
            if was_running {
                metrics.running = metrics.running.saturating_sub(1);
            } else {
                metrics.queued = metrics.queued.saturating_sub(1);
            }
            metrics.failed += 1;
        }
        self.emit(OrchestratorEvent::TaskFailed { task_id, reason });
    }

    /// Emits a backpressure warning.
    pub async fn backpressure(&self, task_id: TaskId, specialty: String) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.backpressure_events += 1;
        }
        self.emit(OrchestratorEvent::Backpressure { task_id, specialty });
    }

    /// Emits a step transition event.
    pub fn step_transitioned(&self, workflow_id: WorkflowId, step_id: String, status: StepStatus) {
        self.emit(OrchestratorEvent::StepTransitioned { workflow_id, step_id, status });
    }

    /// Emits a workflow terminal-status event.
    pub fn workflow_finished(&self, workflow_id: WorkflowId, completed: bool) {
        self.emit(OrchestratorEvent::WorkflowFinished { workflow_id, completed });
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}
