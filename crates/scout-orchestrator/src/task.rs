//! Task types and lifecycle.
//!
//! A task is one unit of work routed to a worker model. The scheduler is the
//! exclusive owner of task state; collaborators only observe snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Priority band of a task (higher band dispatches first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    Medium,
    /// Elevated priority.
    High,
    /// Dispatched ahead of everything else.
    Urgent,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

/// Task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for dispatch.
    Queued,
    /// Executing against a worker model.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
}

impl TaskStatus {
    /// Checks if the task can transition to the given state.
    ///
    /// # Arguments
    /// * `to` - The target state
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // From Queued: dispatch, or terminal failure (cancel/unsupported)
            (Self::Queued, Self::Running | Self::Failed) => true,
            // From Running: success, requeue for retry, or terminal failure
            (Self::Running, Self::Completed | Self::Queued | Self::Failed) => true,
            // Terminal states allow nothing
            _ => false,
        }
    }

    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    /// Every allowed attempt failed; carries the last execution error.
    AttemptsExhausted(String),
    /// The task was cancelled by a collaborator.
    Cancelled,
    /// No model in any tier serves the required specialty.
    UnsupportedSpecialty,
    /// The payload can never succeed on any worker.
    InvalidPayload(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptsExhausted(last) => write!(f, "attempts exhausted: {last}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::UnsupportedSpecialty => write!(f, "unsupported specialty"),
            Self::InvalidPayload(detail) => write!(f, "invalid payload: {detail}"),
        }
    }
}

/// Submission parameters for a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Required capability tag.
    pub specialty: String,
    /// Priority band.
    pub priority: TaskPriority,
    /// Opaque work payload handed to the worker.
    pub payload: serde_json::Value,
    /// Units of quota this task consumes on a model.
    pub cost: u32,
}

impl TaskSpec {
    /// Creates a spec with the given specialty and priority, an empty
    /// payload, and unit cost.
    #[must_use]
    pub fn new(specialty: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            specialty: specialty.into(),
            priority,
            payload: serde_json::Value::Null,
            cost: 1,
        }
    }

    /// Sets the work payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the quota cost.
    #[must_use]
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

/// A single unit of work owned by the scheduler.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Required capability tag.
    pub specialty: String,
    /// Priority band.
    pub priority: TaskPriority,
    /// Opaque work payload.
    pub payload: serde_json::Value,
    /// Units of quota this task consumes.
    pub cost: u32,
    /// Current state.
    pub status: TaskStatus,
    /// The model currently (or last) assigned, if any.
    pub assigned_model: Option<String>,
    /// Number of (re)assignments so far.
    pub attempts: u32,
    /// Completion percentage in [0, 100].
    pub progress: u8,
    /// Models already tried for this task, excluded from re-routing.
    pub excluded_models: HashSet<String>,
    /// Why the task failed, once terminal.
    pub failure: Option<FailureReason>,
    /// Earliest time the task may dispatch again (retry backoff).
    pub next_eligible_at: Option<Instant>,
    /// Count of routing rounds that found nothing available.
    pub route_misses: u32,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a queued task from a submission spec.
    #[must_use]
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            specialty: spec.specialty,
            priority: spec.priority,
            payload: spec.payload,
            cost: spec.cost,
            status: TaskStatus::Queued,
            assigned_model: None,
            attempts: 0,
            progress: 0,
            excluded_models: HashSet::new(),
            failure: None,
            next_eligible_at: None,
            route_misses: 0,
            created_at: Utc::now(),
        }
    }

    /// Computes the retry backoff delay after `exponent` prior misses,
    /// with a small random jitter to avoid dispatch stampedes.
    #[must_use]
    pub fn backoff_delay(exponent: u32, base: Duration, cap: Duration) -> Duration {
        let factor = 2u32.saturating_pow(exponent.min(16));
        let delay = base.saturating_mul(factor).min(cap);
        let jitter = 1.0 + rand::random::<f64>() * 0.2;
        delay.mul_f64(jitter).min(cap.mul_f64(1.2))
    }
}

/// Read-only view of a task, returned to collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: TaskId,
    /// Required capability tag.
    pub specialty: String,
    /// Priority band.
    pub priority: TaskPriority,
    /// Current state.
    pub status: TaskStatus,
    /// Completion percentage in [0, 100].
    pub progress: u8,
    /// The model currently (or last) assigned, if any.
    pub assigned_model: Option<String>,
    /// Number of (re)assignments so far.
    pub attempts: u32,
    /// Failure reason, once terminal.
    pub failure: Option<FailureReason>,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            specialty: task.specialty.clone(),
            priority: task.priority,
            status: task.status,
            progress: task.progress,
            assigned_model: task.assigned_model.clone(),
            attempts: task.attempts,
            failure: task.failure.clone(),
            created_at: task.created_at,
        }
    }
}
