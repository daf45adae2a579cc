//! Workflow engine: DAGs of dependent steps driven to completion.
//!
//! A workflow is an ordered DAG of named steps, each wrapping exactly one
//! logical task (possibly retried by the scheduler). The engine owns the
//! step-to-task association and only ever reads task snapshots; task state
//! itself belongs to the scheduler. Dependency resolution is incremental:
//! each step carries a count of unmet dependencies which is decremented as
//! upstream steps complete, so a tick never rewalks the whole graph.

use crate::error::SchedulerError;
use crate::events::{OrchestratorEvent, StatusReporter};
use crate::scheduler::TaskScheduler;
use crate::task::{TaskId, TaskPriority, TaskSnapshot, TaskSpec, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique workflow identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Generates a fresh workflow id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workflow-{}", self.0)
    }
}

/// Errors that can occur when managing workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A workflow must have at least one step.
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    /// Two steps share an id.
    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    /// A step depends on an id that is not part of the workflow.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// The dependent step.
        step: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Workflow dependency graph contains a cycle")]
    DependencyCycle,

    /// No workflow with this id is known to the engine.
    #[error("Workflow not found: {0}")]
    NotFound(WorkflowId),

    /// The engine loop is already running.
    #[error("Workflow engine is already running")]
    AlreadyRunning,

    /// The engine loop is not running.
    #[error("Workflow engine is not running")]
    NotRunning,

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Workflow step state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies satisfied; about to be submitted.
    Ready,
    /// Underlying task is in flight.
    Running,
    /// Underlying task completed. Terminal.
    Completed,
    /// Underlying task failed terminally. Terminal.
    Failed,
    /// An upstream dependency failed; this step will never run. Terminal.
    Skipped,
}

impl StepStatus {
    /// Checks if the step can transition to the given state.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::Pending, Self::Ready | Self::Skipped) => true,
            (Self::Ready, Self::Running | Self::Skipped) => true,
            (Self::Running, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }

    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Aggregate workflow state, derived from step states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Created but nothing submitted yet.
    Planning,
    /// At least one step can still make progress.
    Running,
    /// Every step completed. Terminal.
    Completed,
    /// A step failed and nothing left can change the outcome. Terminal.
    Failed,
    /// Cancelled by a collaborator. Terminal.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a step ended in `Failed` or `Skipped`.
///
/// Cascade skips are surfaced distinctly from direct failures so operators
/// can tell root cause from fallout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum StepFailure {
    /// The step's own task failed.
    Direct(String),
    /// An upstream dependency failed, so this step never became ready.
    DependencyFailed {
        /// The failed (or skipped) upstream step.
        upstream: String,
    },
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(reason) => write!(f, "{reason}"),
            Self::DependencyFailed { upstream } => {
                write!(f, "dependency '{upstream}' failed")
            }
        }
    }
}

/// Definition of one step at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id, unique within the workflow.
    pub id: String,
    /// Required capability tag for the underlying task.
    pub specialty: String,
    /// Priority of the underlying task.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Opaque work payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Quota cost of the underlying task.
    #[serde(default = "default_cost")]
    pub cost: u32,
    /// Ids of steps that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_cost() -> u32 {
    1
}

impl StepDefinition {
    /// Creates a step with the given id and specialty, no dependencies,
    /// default priority, and unit cost.
    #[must_use]
    pub fn new(id: impl Into<String>, specialty: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            specialty: specialty.into(),
            priority: TaskPriority::default(),
            payload: serde_json::Value::Null,
            cost: 1,
            depends_on: Vec::new(),
        }
    }

    /// Adds a dependency on another step.
    #[must_use]
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Sets the priority of the underlying task.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the work payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// One step inside a live workflow.
#[derive(Debug, Clone)]
struct WorkflowStep {
    definition: StepDefinition,
    status: StepStatus,
    task_id: Option<TaskId>,
    failure: Option<StepFailure>,
}

/// Read-only view of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    /// Step id.
    pub id: String,
    /// Current state.
    pub status: StepStatus,
    /// The underlying task, once submitted.
    pub task_id: Option<TaskId>,
    /// Failure cause, once terminal and unsuccessful.
    pub failure: Option<StepFailure>,
    /// Ids of steps this one waits on.
    pub depends_on: Vec<String>,
}

/// Read-only view of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Workflow id.
    pub id: WorkflowId,
    /// Aggregate status.
    pub status: WorkflowStatus,
    /// Percentage of steps completed, in [0, 100].
    pub progress: u8,
    /// Per-step views, in definition order.
    pub steps: Vec<StepSnapshot>,
}

/// Live state of one workflow.
struct WorkflowState {
    id: WorkflowId,
    steps: HashMap<String, WorkflowStep>,
    /// Definition order, for deterministic snapshots.
    order: Vec<String>,
    /// Count of not-yet-completed dependencies per step.
    unmet: HashMap<String, usize>,
    /// Reverse dependency edges.
    dependents: HashMap<String, Vec<String>>,
    status: WorkflowStatus,
}

/// Workflow engine over the task scheduler.
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
    /// Shutdown signal sender for the engine loop.
    shutdown_tx: StdMutex<Option<watch::Sender<()>>>,
}

struct EngineInner {
    /// Live workflows; each has its own lock so transitions within one
    /// workflow are serialized while distinct workflows progress in parallel.
    workflows: RwLock<HashMap<WorkflowId, Arc<Mutex<WorkflowState>>>>,
    /// Task id to owning (workflow, step).
    task_index: RwLock<HashMap<TaskId, (WorkflowId, String)>>,
    scheduler: Arc<TaskScheduler>,
    reporter: Arc<StatusReporter>,
    tick_interval: Duration,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Creates a new workflow engine.
    ///
    /// # Arguments
    /// * `scheduler` - The task scheduler that executes step tasks
    /// * `reporter` - Status event feed (shared with the scheduler)
    /// * `tick_interval` - Fallback re-evaluation interval
    #[must_use]
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        reporter: Arc<StatusReporter>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                workflows: RwLock::new(HashMap::new()),
                task_index: RwLock::new(HashMap::new()),
                scheduler,
                reporter,
                tick_interval,
            }),
            shutdown_tx: StdMutex::new(None),
        }
    }

    /// Starts the engine loop in a background task.
    ///
    /// The loop reacts to scheduler task events and re-evaluates live
    /// workflows on a periodic tick as a safety net for missed events.
    ///
    /// # Errors
    /// Returns `WorkflowError::AlreadyRunning` if the loop is active.
    pub fn start(&self) -> Result<(), WorkflowError> {
        let mut shutdown = self.shutdown_tx.lock().unwrap();
        if shutdown.is_some() {
            return Err(WorkflowError::AlreadyRunning);
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        *shutdown = Some(shutdown_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            info!("Workflow engine started");

            let mut events = inner.reporter.subscribe();
            let mut interval = time::interval(inner.tick_interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Workflow engine shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {
                        inner.sweep().await;
                    }
                    event = events.recv() => match event {
                        Ok(OrchestratorEvent::TaskCompleted { task_id, .. }
                            | OrchestratorEvent::TaskFailed { task_id, .. }) => {
                            inner.on_task_terminal(task_id).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed = missed, "Event feed lagged, resyncing workflows");
                            inner.sweep().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            info!("Workflow engine stopped");
        });

        Ok(())
    }

    /// Stops the engine loop gracefully.
    ///
    /// # Errors
    /// Returns `WorkflowError::NotRunning` if the loop is not active.
    pub fn stop(&self) -> Result<(), WorkflowError> {
        let mut shutdown = self.shutdown_tx.lock().unwrap();
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(());
            Ok(())
        } else {
            Err(WorkflowError::NotRunning)
        }
    }

    /// Checks if the engine loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().unwrap().is_some()
    }

    /// Starts a new workflow from step definitions.
    ///
    /// Validates the dependency graph and immediately submits every step
    /// whose dependencies are already satisfied.
    ///
    /// # Errors
    /// Returns a validation error for empty workflows, duplicate step ids,
    /// unknown dependencies, or dependency cycles.
    pub async fn start_workflow(
        &self,
        definitions: Vec<StepDefinition>,
    ) -> Result<WorkflowId, WorkflowError> {
        Self::validate(&definitions)?;

        let id = WorkflowId::new();
        let mut steps = HashMap::new();
        let mut order = Vec::new();
        let mut unmet = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for definition in definitions {
            order.push(definition.id.clone());
            unmet.insert(definition.id.clone(), definition.depends_on.len());
            for dependency in &definition.depends_on {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(definition.id.clone());
            }
            steps.insert(
                definition.id.clone(),
                WorkflowStep {
                    definition,
                    status: StepStatus::Pending,
                    task_id: None,
                    failure: None,
                },
            );
        }

        let state = Arc::new(Mutex::new(WorkflowState {
            id,
            steps,
            order,
            unmet,
            dependents,
            status: WorkflowStatus::Planning,
        }));

        info!(workflow_id = %id, "Workflow started");
        self.inner.workflows.write().await.insert(id, Arc::clone(&state));

        let mut guard = state.lock().await;
        self.inner.submit_ready(&mut guard).await;
        self.inner.refresh_status(&mut guard);

        Ok(id)
    }

    /// Returns a snapshot of one workflow.
    ///
    /// Repeated calls without new events return identical results.
    ///
    /// # Errors
    /// Returns `WorkflowError::NotFound` for an unknown id.
    pub async fn get_status(&self, id: WorkflowId) -> Result<WorkflowSnapshot, WorkflowError> {
        let state = {
            let workflows = self.inner.workflows.read().await;
            workflows.get(&id).cloned().ok_or(WorkflowError::NotFound(id))?
        };

        let guard = state.lock().await;
        Ok(Self::snapshot_of(&guard))
    }

    /// Cancels a workflow: running steps' tasks are cancelled best-effort,
    /// steps that never started are skipped, and the workflow ends
    /// `Cancelled`.
    ///
    /// # Errors
    /// Returns `WorkflowError::NotFound` for an unknown id.
    pub async fn cancel_workflow(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        let state = {
            let workflows = self.inner.workflows.read().await;
            workflows.get(&id).cloned().ok_or(WorkflowError::NotFound(id))?
        };

        let in_flight = {
            let mut guard = state.lock().await;
            if guard.status.is_terminal() {
                return Ok(());
            }

            let mut in_flight = Vec::new();
            let step_ids: Vec<String> = guard.order.clone();
            for step_id in step_ids {
                let Some(step) = guard.steps.get_mut(&step_id) else { continue };
                match step.status {
                    StepStatus::Pending | StepStatus::Ready => {
                        step.status = StepStatus::Skipped;
                        step.failure = Some(StepFailure::Direct("workflow cancelled".to_string()));
                        self.inner.reporter.step_transitioned(id, step_id.clone(), StepStatus::Skipped);
                    }
                    StepStatus::Running => {
                        step.status = StepStatus::Failed;
                        step.failure = Some(StepFailure::Direct("workflow cancelled".to_string()));
                        if let Some(task_id) = step.task_id {
                            in_flight.push(task_id);
                        }
                        self.inner.reporter.step_transitioned(id, step_id.clone(), StepStatus::Failed);
                    }
                    _ => {}
                }
            }
            guard.status = WorkflowStatus::Cancelled;
            in_flight
        };

        {
            let mut index = self.inner.task_index.write().await;
            for task_id in &in_flight {
                index.remove(task_id);
            }
        }

        for task_id in in_flight {
            if let Err(e) = self.inner.scheduler.cancel(task_id).await {
                debug!(task_id = %task_id, error = %e, "Task already settled during cancel");
            }
        }

        info!(workflow_id = %id, "Workflow cancelled");
        self.inner.reporter.workflow_finished(id, false);
        Ok(())
    }

    /// Builds a snapshot from locked workflow state.
    fn snapshot_of(state: &WorkflowState) -> WorkflowSnapshot {
        let total = state.order.len().max(1);
        let completed = state
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count();

        WorkflowSnapshot {
            id: state.id,
            status: state.status,
            progress: ((completed * 100) / total) as u8,
            steps: state
                .order
                .iter()
                .filter_map(|step_id| state.steps.get(step_id))
                .map(|step| StepSnapshot {
                    id: step.definition.id.clone(),
                    status: step.status,
                    task_id: step.task_id,
                    failure: step.failure.clone(),
                    depends_on: step.definition.depends_on.clone(),
                })
                .collect(),
        }
    }

    /// Validates step definitions: ids unique, dependencies known, graph
    /// acyclic.
    fn validate(definitions: &[StepDefinition]) -> Result<(), WorkflowError> {
        if definitions.is_empty() {
            return Err(WorkflowError::EmptyWorkflow);
        }

        let mut ids = HashSet::new();
        for definition in definitions {
            if !ids.insert(definition.id.as_str()) {
                return Err(WorkflowError::DuplicateStep(definition.id.clone()));
            }
        }

        for definition in definitions {
            for dependency in &definition.depends_on {
                if !ids.contains(dependency.as_str()) {
                    return Err(WorkflowError::UnknownDependency {
                        step: definition.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm over the dependency graph.
        let mut indegree: HashMap<&str, usize> = definitions
            .iter()
            .map(|d| (d.id.as_str(), d.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for definition in definitions {
            for dependency in &definition.depends_on {
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(definition.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                let count = indegree.get_mut(dependent).unwrap();
                *count -= 1;
                if *count == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != definitions.len() {
            return Err(WorkflowError::DependencyCycle);
        }

        Ok(())
    }
}

impl EngineInner {
    /// Handles a terminal task event from the scheduler.
    async fn on_task_terminal(&self, task_id: TaskId) {
        let owner = {
            let index = self.task_index.read().await;
            index.get(&task_id).cloned()
        };
        let Some((workflow_id, step_id)) = owner else { return };

        let Ok(snapshot) = self.scheduler.task_snapshot(task_id).await else { return };
        if !snapshot.status.is_terminal() {
            return;
        }

        self.task_index.write().await.remove(&task_id);

        let state = {
            let workflows = self.workflows.read().await;
            workflows.get(&workflow_id).cloned()
        };
        let Some(state) = state else { return };

        let mut guard = state.lock().await;
        self.apply_step_outcome(&mut guard, &step_id, &snapshot).await;
    }

    /// Tick fallback: re-reads running steps' tasks in case an event was
    /// missed (e.g., the feed lagged or the engine started late).
    async fn sweep(&self) {
        let states: Vec<Arc<Mutex<WorkflowState>>> = {
            let workflows = self.workflows.read().await;
            workflows.values().cloned().collect()
        };

        for state in states {
            let mut guard = state.lock().await;
            if guard.status.is_terminal() {
                continue;
            }

            let running: Vec<(String, TaskId)> = guard
                .steps
                .values()
                .filter(|s| s.status == StepStatus::Running)
                .filter_map(|s| s.task_id.map(|t| (s.definition.id.clone(), t)))
                .collect();

            for (step_id, task_id) in running {
                let Ok(snapshot) = self.scheduler.task_snapshot(task_id).await else { continue };
                if snapshot.status.is_terminal() {
                    self.task_index.write().await.remove(&task_id);
                    self.apply_step_outcome(&mut guard, &step_id, &snapshot).await;
                }
            }
        }
    }

    /// Applies a terminal task outcome to its owning step, unlocking
    /// dependents or propagating skips, then refreshes workflow status.
    async fn apply_step_outcome(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        task: &TaskSnapshot,
    ) {
        let workflow_id = state.id;
        {
            let Some(step) = state.steps.get_mut(step_id) else { return };
            if step.status != StepStatus::Running {
                return;
            }

            match task.status {
                TaskStatus::Completed => {
                    step.status = StepStatus::Completed;
                    debug!(workflow_id = %workflow_id, step_id = %step_id, "Step completed");
                }
                TaskStatus::Failed => {
                    step.status = StepStatus::Failed;
                    let reason = task
                        .failure
                        .as_ref()
                        .map_or_else(|| "task failed".to_string(), ToString::to_string);
                    step.failure = Some(StepFailure::Direct(reason));
                    warn!(workflow_id = %workflow_id, step_id = %step_id, "Step failed");
                }
                _ => return,
            }
        }
        let new_status = state.steps[step_id].status;
        self.reporter.step_transitioned(workflow_id, step_id.to_string(), new_status);

        match new_status {
            StepStatus::Completed => {
                let dependents = state.dependents.get(step_id).cloned().unwrap_or_default();
                for dependent in dependents {
                    if let Some(count) = state.unmet.get_mut(&dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
                self.submit_ready(state).await;
            }
            StepStatus::Failed => {
                self.propagate_skips(state, step_id);
            }
            _ => {}
        }

        self.refresh_status(state);
    }

    /// Submits every pending step whose dependencies are all completed.
    async fn submit_ready(&self, state: &mut WorkflowState) {
        let ready: Vec<String> = state
            .order
            .iter()
            .filter(|step_id| {
                state.steps.get(*step_id).is_some_and(|s| s.status == StepStatus::Pending)
                    && state.unmet.get(*step_id).copied().unwrap_or(0) == 0
            })
            .cloned()
            .collect();

        for step_id in ready {
            let spec = {
                let Some(step) = state.steps.get_mut(&step_id) else { continue };
                step.status = StepStatus::Ready;
                TaskSpec::new(step.definition.specialty.clone(), step.definition.priority)
                    .with_payload(step.definition.payload.clone())
                    .with_cost(step.definition.cost)
            };
            self.reporter.step_transitioned(state.id, step_id.clone(), StepStatus::Ready);

            let task_id = self.scheduler.submit(spec).await;
            self.task_index.write().await.insert(task_id, (state.id, step_id.clone()));

            if let Some(step) = state.steps.get_mut(&step_id) {
                step.task_id = Some(task_id);
                step.status = StepStatus::Running;
            }
            debug!(workflow_id = %state.id, step_id = %step_id, task_id = %task_id, "Step submitted");
            self.reporter.step_transitioned(state.id, step_id.clone(), StepStatus::Running);
        }
    }

    /// Marks every transitive dependent of a failed step as skipped.
    fn propagate_skips(&self, state: &mut WorkflowState, failed_step: &str) {
        let mut frontier = VecDeque::new();
        frontier.push_back(failed_step.to_string());

        while let Some(upstream) = frontier.pop_front() {
            let dependents = state.dependents.get(&upstream).cloned().unwrap_or_default();
            for dependent in dependents {
                let Some(step) = state.steps.get_mut(&dependent) else { continue };
                if step.status.is_terminal() || step.status == StepStatus::Running {
                    continue;
                }
                step.status = StepStatus::Skipped;
                step.failure =
                    Some(StepFailure::DependencyFailed { upstream: upstream.clone() });
                debug!(
                    workflow_id = %state.id,
                    step_id = %dependent,
                    upstream = %upstream,
                    "Step skipped, upstream dependency failed"
                );
                self.reporter.step_transitioned(state.id, dependent.clone(), StepStatus::Skipped);
                frontier.push_back(dependent);
            }
        }
    }

    /// Re-derives the aggregate workflow status from step states.
    fn refresh_status(&self, state: &mut WorkflowState) {
        if state.status.is_terminal() {
            return;
        }

        let mut any_failed = false;
        let mut any_active = false;
        let mut all_completed = true;

        for step in state.steps.values() {
            match step.status {
                StepStatus::Completed => {}
                StepStatus::Failed => {
                    any_failed = true;
                    all_completed = false;
                }
                StepStatus::Skipped => {
                    all_completed = false;
                }
                StepStatus::Pending | StepStatus::Ready | StepStatus::Running => {
                    any_active = true;
                    all_completed = false;
                }
            }
        }

        let next = if all_completed {
            WorkflowStatus::Completed
        } else if any_failed && !any_active {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Running
        };

        if next != state.status {
            state.status = next;
            info!(workflow_id = %state.id, status = ?next, "Workflow status changed");
            if next.is_terminal() {
                self.reporter.workflow_finished(state.id, next == WorkflowStatus::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> StepDefinition {
        StepDefinition::new(id, "summarize")
    }

    #[test]
    fn test_validate_empty() {
        assert!(matches!(
            WorkflowEngine::validate(&[]),
            Err(WorkflowError::EmptyWorkflow)
        ));
    }

    #[test]
    fn test_validate_duplicate_step() {
        let result = WorkflowEngine::validate(&[step("a"), step("a")]);
        assert!(matches!(result, Err(WorkflowError::DuplicateStep(_))));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let result = WorkflowEngine::validate(&[step("a").depends_on("ghost")]);
        assert!(matches!(result, Err(WorkflowError::UnknownDependency { .. })));
    }

    #[test]
    fn test_validate_cycle() {
        let result = WorkflowEngine::validate(&[
            step("a").depends_on("b"),
            step("b").depends_on("a"),
        ]);
        assert!(matches!(result, Err(WorkflowError::DependencyCycle)));
    }

    #[test]
    fn test_validate_self_dependency() {
        let result = WorkflowEngine::validate(&[step("a").depends_on("a")]);
        assert!(matches!(result, Err(WorkflowError::DependencyCycle)));
    }

    #[test]
    fn test_validate_valid_dag() {
        let result = WorkflowEngine::validate(&[
            step("a"),
            step("b").depends_on("a"),
            step("c").depends_on("a"),
            step("d").depends_on("b").depends_on("c"),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_step_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Ready));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Running));

        assert!(StepStatus::Ready.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Failed));

        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Ready));
    }

    #[test]
    fn test_step_failure_display() {
        let direct = StepFailure::Direct("boom".to_string());
        assert_eq!(direct.to_string(), "boom");

        let cascade = StepFailure::DependencyFailed { upstream: "a".to_string() };
        assert_eq!(cascade.to_string(), "dependency 'a' failed");
    }
}
