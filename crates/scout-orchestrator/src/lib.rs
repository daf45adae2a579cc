//! Scout orchestrator.
//!
//! A multi-tier scheduler for pools of AI worker models: admission control
//! against time-windowed quotas, health-aware tier fallback, a priority task
//! queue with retry and backoff, and a workflow engine that drives DAGs of
//! dependent steps to completion.
//!
//! The orchestrator performs no inference itself; execution is delegated to
//! a [`scout_abstraction::WorkerBackend`] collaborator.

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod queue;
pub mod quota;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod task;
pub mod workers;
pub mod workflow;

use scout_abstraction::WorkerBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

pub use config::{ConfigError, ConfigLoader, ModelDefinition, OrchestratorConfig, SchedulerConfig};
pub use error::SchedulerError;
pub use events::{OrchestratorEvent, SchedulerMetrics, StatusReporter};
pub use model::{Availability, ModelSnapshot, ModelTier, WorkerModel};
pub use queue::TaskQueue;
pub use quota::{QuotaError, QuotaTracker, QuotaUsage};
pub use registry::{ModelRegistry, RegistryError};
pub use router::{ModelRouter, RouteSelection, RoutingError};
pub use scheduler::TaskScheduler;
pub use task::{
    FailureReason, Task, TaskId, TaskPriority, TaskSnapshot, TaskSpec, TaskStatus,
};
pub use workers::EchoWorker;
pub use workflow::{
    StepDefinition, StepFailure, StepSnapshot, StepStatus, WorkflowEngine, WorkflowError,
    WorkflowId, WorkflowSnapshot, WorkflowStatus,
};

/// Facade over the scheduler stack: registry, quota, router, task scheduler,
/// and workflow engine, wired together and exposed as the in-process API
/// consumed by collaborator layers.
pub struct Orchestrator {
    /// Model catalog.
    registry: Arc<ModelRegistry>,
    /// Quota tracker.
    quota: Arc<QuotaTracker>,
    /// Task scheduler.
    scheduler: Arc<TaskScheduler>,
    /// Workflow engine.
    engine: WorkflowEngine,
    /// Status event feed shared across components.
    reporter: Arc<StatusReporter>,
    /// Scheduler tuning (kept for snapshot assembly).
    config: SchedulerConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("model_count", &self.registry.count())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator instance from a configuration.
    ///
    /// Each instance owns an isolated registry and quota tracker; nothing is
    /// process-global.
    ///
    /// # Arguments
    /// * `config` - Scheduler tuning plus the model pool
    /// * `backend` - Worker execution collaborator
    #[must_use]
    pub fn new(config: OrchestratorConfig, backend: Arc<dyn WorkerBackend>) -> Self {
        let reporter = Arc::new(StatusReporter::new());
        let registry = Arc::new(ModelRegistry::new(&config.models, &config.scheduler));

        let quota = Arc::new(QuotaTracker::new());
        for definition in &config.models {
            let window = definition
                .quota_window_secs
                .map_or(config.scheduler.quota_window, Duration::from_secs_f64);
            quota.register_model(&definition.id, definition.quota_limit, window);
        }

        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&quota),
            backend,
            Arc::clone(&reporter),
            config.scheduler.clone(),
        ));
        let engine = WorkflowEngine::new(
            Arc::clone(&scheduler),
            Arc::clone(&reporter),
            config.scheduler.tick_interval,
        );

        debug!(model_count = config.models.len(), "Orchestrator constructed");

        Self { registry, quota, scheduler, engine, reporter, config: config.scheduler }
    }

    /// Creates an orchestrator from a TOML configuration file.
    ///
    /// # Errors
    /// Returns a configuration error if the file cannot be loaded or fails
    /// validation.
    pub fn from_config_path(
        path: &std::path::Path,
        backend: Arc<dyn WorkerBackend>,
    ) -> Result<Self, ConfigError> {
        let config = ConfigLoader::load(path)?;
        Ok(Self::new(config, backend))
    }

    /// Starts the scheduling and workflow loops.
    ///
    /// # Errors
    /// Returns an error if either loop is already running.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler.start()?;
        if let Err(e) = self.engine.start() {
            // Roll the scheduler back so start() is all-or-nothing.
            let _ = self.scheduler.stop();
            debug!(error = %e, "Engine start failed, scheduler rolled back");
            return Err(SchedulerError::AlreadyRunning);
        }
        Ok(())
    }

    /// Stops both loops gracefully. In-flight executions settle their quota
    /// before the process should exit.
    pub fn shutdown(&self) {
        let _ = self.engine.stop();
        let _ = self.scheduler.stop();
    }

    /// Submits a standalone task.
    ///
    /// # Arguments
    /// * `specialty` - Required capability tag
    /// * `priority` - Priority band
    /// * `payload` - Opaque work payload
    ///
    /// # Returns
    /// The id of the queued task.
    pub async fn submit_task(
        &self,
        specialty: impl Into<String>,
        priority: TaskPriority,
        payload: serde_json::Value,
    ) -> TaskId {
        self.scheduler
            .submit(TaskSpec::new(specialty, priority).with_payload(payload))
            .await
    }

    /// Returns the status of one task.
    ///
    /// # Errors
    /// Returns `SchedulerError::TaskNotFound` for an unknown id.
    pub async fn task_status(&self, task_id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.scheduler.task_snapshot(task_id).await
    }

    /// Cancels a task (best-effort once running).
    ///
    /// # Errors
    /// Returns `SchedulerError::TaskNotFound` for an unknown id.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        self.scheduler.cancel(task_id).await
    }

    /// Returns snapshots of all tasks, oldest first.
    pub async fn poll_tasks(&self) -> Vec<TaskSnapshot> {
        self.scheduler.poll().await
    }

    /// Starts a workflow from step definitions.
    ///
    /// # Errors
    /// Returns a validation error for a malformed dependency graph.
    pub async fn start_workflow(
        &self,
        steps: Vec<StepDefinition>,
    ) -> Result<WorkflowId, WorkflowError> {
        self.engine.start_workflow(steps).await
    }

    /// Returns the status of one workflow with per-step detail.
    ///
    /// # Errors
    /// Returns `WorkflowError::NotFound` for an unknown id.
    pub async fn workflow_status(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowSnapshot, WorkflowError> {
        self.engine.get_status(workflow_id).await
    }

    /// Cancels a workflow and all of its non-terminal tasks.
    ///
    /// # Errors
    /// Returns `WorkflowError::NotFound` for an unknown id.
    pub async fn cancel_workflow(&self, workflow_id: WorkflowId) -> Result<(), WorkflowError> {
        self.engine.cancel_workflow(workflow_id).await
    }

    /// Returns a read-only snapshot of the model pool with quota usage,
    /// suitable for dashboards.
    pub fn list_models(&self) -> Vec<ModelSnapshot> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|model| {
                let usage = self.quota.usage(&model.id).unwrap_or(QuotaUsage { used: 0, limit: 0 });
                ModelSnapshot {
                    is_healthy: model.availability.is_routable()
                        && model.health_score >= self.config.health_floor,
                    id: model.id,
                    tier: model.tier,
                    health_score: model.health_score,
                    quota_used: usage.used,
                    quota_limit: usage.limit,
                    consecutive_errors: model.consecutive_errors,
                    last_active: model.last_active,
                }
            })
            .collect()
    }

    /// Subscribes to the status event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.reporter.subscribe()
    }

    /// Returns the current aggregate scheduler metrics.
    pub async fn metrics(&self) -> SchedulerMetrics {
        self.reporter.snapshot().await
    }
}
