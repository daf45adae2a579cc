//! Task scheduler: queue ownership, dispatch, and recovery.
//!
//! The scheduler owns every [`Task`] exclusively. A single background loop
//! per scheduler instance drains the dispatch queue on a periodic tick plus
//! event-driven wakeups; dispatch itself is asynchronous, so the loop never
//! blocks on worker execution. Transient model failures are retried on a
//! different model; exhausted tiers leave the task queued with bounded
//! exponential backoff rather than failing it.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::events::StatusReporter;
use crate::queue::TaskQueue;
use crate::quota::QuotaTracker;
use crate::registry::ModelRegistry;
use crate::router::{ModelRouter, RoutingError};
use crate::task::{FailureReason, Task, TaskId, TaskSnapshot, TaskSpec, TaskStatus};
use scout_abstraction::{ExecutionError, WorkOrder, WorkerBackend};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Task scheduler for the worker pool.
pub struct TaskScheduler {
    /// Shared scheduler state.
    inner: Arc<SchedulerInner>,
    /// Shutdown signal sender for the dispatch loop.
    shutdown_tx: StdMutex<Option<watch::Sender<()>>>,
}

struct SchedulerInner {
    /// All tasks ever submitted, keyed by id.
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// Dispatch queue.
    queue: TaskQueue,
    /// Router over the model pool.
    router: ModelRouter,
    /// Model catalog.
    registry: Arc<ModelRegistry>,
    /// Quota tracker.
    quota: Arc<QuotaTracker>,
    /// Worker execution collaborator.
    backend: Arc<dyn WorkerBackend>,
    /// Status event feed.
    reporter: Arc<StatusReporter>,
    /// Scheduler tuning.
    config: SchedulerConfig,
    /// Wakeup for event-driven dispatch between ticks.
    wake: Notify,
    /// Cancellation tokens for in-flight executions.
    cancellations: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Creates a new scheduler.
    ///
    /// # Arguments
    /// * `registry` - Model catalog
    /// * `quota` - Quota tracker
    /// * `backend` - Worker execution collaborator
    /// * `reporter` - Status event feed
    /// * `config` - Scheduler tuning
    #[must_use]
    pub fn new(
        registry: Arc<ModelRegistry>,
        quota: Arc<QuotaTracker>,
        backend: Arc<dyn WorkerBackend>,
        reporter: Arc<StatusReporter>,
        config: SchedulerConfig,
    ) -> Self {
        let router =
            ModelRouter::new(Arc::clone(&registry), Arc::clone(&quota), config.health_floor);
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: RwLock::new(HashMap::new()),
                queue: TaskQueue::new(),
                router,
                registry,
                quota,
                backend,
                reporter,
                config,
                wake: Notify::new(),
                cancellations: Mutex::new(HashMap::new()),
            }),
            shutdown_tx: StdMutex::new(None),
        }
    }

    /// Starts the dispatch loop in a background task.
    ///
    /// # Errors
    /// Returns `SchedulerError::AlreadyRunning` if the loop is active.
    pub fn start(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.lock().unwrap();
        if shutdown.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        *shutdown = Some(shutdown_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            info!("Task scheduler started");

            let mut interval = time::interval(inner.config.tick_interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Task scheduler shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {}
                    () = inner.wake.notified() => {}
                }

                inner.dispatch_eligible().await;
            }

            info!("Task scheduler stopped");
        });

        Ok(())
    }

    /// Stops the dispatch loop gracefully.
    ///
    /// In-flight executions finish and settle their quota; nothing new
    /// dispatches afterward.
    ///
    /// # Errors
    /// Returns `SchedulerError::NotRunning` if the loop is not active.
    pub fn stop(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.lock().unwrap();
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(());
            Ok(())
        } else {
            Err(SchedulerError::NotRunning)
        }
    }

    /// Checks if the dispatch loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().unwrap().is_some()
    }

    /// Submits a task for execution.
    ///
    /// # Arguments
    /// * `spec` - Submission parameters
    ///
    /// # Returns
    /// The id of the queued task.
    pub async fn submit(&self, spec: TaskSpec) -> TaskId {
        let task = Task::new(spec);
        let id = task.id;
        let priority = task.priority;

        debug!(task_id = %id, specialty = %task.specialty, priority = %priority, "Task submitted");

        self.inner.tasks.write().await.insert(id, task);
        self.inner.queue.push(id, priority).await;
        self.inner.reporter.task_queued(id).await;
        self.inner.wake.notify_one();
        id
    }

    /// Cancels a task.
    ///
    /// A queued task fails immediately; a running task is cancelled
    /// best-effort — the worker may still finish, but its result is
    /// discarded and the quota is released as if the attempt failed.
    ///
    /// # Errors
    /// Returns `SchedulerError::TaskNotFound` for an unknown id.
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        let was_running = {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or(SchedulerError::TaskNotFound(task_id))?;
            match task.status {
                TaskStatus::Queued => {
                    task.status = TaskStatus::Failed;
                    task.failure = Some(FailureReason::Cancelled);
                    Some(false)
                }
                TaskStatus::Running => {
                    task.status = TaskStatus::Failed;
                    task.failure = Some(FailureReason::Cancelled);
                    Some(true)
                }
                // Cancelling a finished task is a no-op.
                _ => None,
            }
        };

        match was_running {
            Some(false) => {
                info!(task_id = %task_id, "Cancelled queued task");
                self.inner
                    .reporter
                    .task_failed(task_id, FailureReason::Cancelled.to_string(), false)
                    .await;
            }
            Some(true) => {
                info!(task_id = %task_id, "Cancelling running task (best effort)");
                self.inner
                    .reporter
                    .task_failed(task_id, FailureReason::Cancelled.to_string(), true)
                    .await;
                if let Some(token) = self.inner.cancellations.lock().await.remove(&task_id) {
                    token.cancel();
                }
            }
            None => {}
        }

        Ok(())
    }

    /// Returns a snapshot of one task.
    ///
    /// # Errors
    /// Returns `SchedulerError::TaskNotFound` for an unknown id.
    pub async fn task_snapshot(&self, task_id: TaskId) -> Result<TaskSnapshot> {
        let tasks = self.inner.tasks.read().await;
        tasks
            .get(&task_id)
            .map(TaskSnapshot::from)
            .ok_or(SchedulerError::TaskNotFound(task_id))
    }

    /// Returns snapshots of all tasks, oldest first.
    pub async fn poll(&self) -> Vec<TaskSnapshot> {
        let tasks = self.inner.tasks.read().await;
        let mut out: Vec<TaskSnapshot> = tasks.values().map(TaskSnapshot::from).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.to_string().cmp(&b.id.to_string())));
        out
    }

    /// Gets the status reporter for subscriptions and metrics.
    pub fn reporter(&self) -> Arc<StatusReporter> {
        Arc::clone(&self.inner.reporter)
    }
}

impl SchedulerInner {
    /// Dispatches every queued task that is eligible right now.
    async fn dispatch_eligible(self: &Arc<Self>) {
        let now = Instant::now();
        while let Some(task_id) = self.queue.pop_eligible(now).await {
            self.try_dispatch(task_id).await;
        }
    }

    /// Routes and launches one task, or parks it with backoff.
    async fn try_dispatch(self: &Arc<Self>, task_id: TaskId) {
        // Queue entries are lazy: a task cancelled while queued is dropped here.
        let (specialty, excluded, cost) = {
            let tasks = self.tasks.read().await;
            match tasks.get(&task_id) {
                Some(task) if task.status == TaskStatus::Queued => {
                    (task.specialty.clone(), task.excluded_models.clone(), task.cost)
                }
                _ => return,
            }
        };

        match self.router.select(&specialty, &excluded, cost) {
            Ok(selection) => match self.quota.try_reserve(&selection.model_id, cost) {
                Ok(()) => self.launch(task_id, selection.model_id, cost).await,
                Err(e) => {
                    // Lost the budget to a concurrent reservation; back off.
                    debug!(task_id = %task_id, error = %e, "Reservation denied after dry-run");
                    self.defer(task_id, &specialty, false).await;
                }
            },
            Err(RoutingError::UnsupportedSpecialty { .. }) => {
                // No catalog change can fix this mid-run; fail immediately.
                self.fail_task(task_id, FailureReason::UnsupportedSpecialty).await;
            }
            Err(error @ RoutingError::AllCandidatesTried { .. }) => {
                self.fail_task(task_id, FailureReason::AttemptsExhausted(error.to_string()))
                    .await;
            }
            Err(RoutingError::NoneAvailable { .. }) => {
                self.defer(task_id, &specialty, true).await;
            }
        }
    }

    /// Parks a task with bounded exponential backoff.
    async fn defer(self: &Arc<Self>, task_id: TaskId, specialty: &str, backpressure: bool) {
        let parked = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(&task_id).map(|task| {
                task.route_misses += 1;
                let delay = Task::backoff_delay(
                    task.route_misses - 1,
                    self.config.retry_backoff_base,
                    self.config.retry_backoff_cap,
                );
                let at = Instant::now() + delay;
                task.next_eligible_at = Some(at);
                (task.priority, at, delay)
            })
        };

        let Some((priority, at, delay)) = parked else { return };
        self.queue.push_after(task_id, priority, Some(at)).await;

        if backpressure {
            warn!(
                task_id = %task_id,
                specialty = %specialty,
                backoff_ms = delay.as_millis() as u64,
                "All tiers exhausted, task stays queued"
            );
            self.reporter.backpressure(task_id, specialty.to_string()).await;
        }
    }

    /// Marks a task running and spawns its execution out-of-line.
    async fn launch(self: &Arc<Self>, task_id: TaskId, model_id: String, cost: u32) {
        let launched = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(&task_id).and_then(|task| {
                if !task.status.can_transition_to(TaskStatus::Running) {
                    return None;
                }
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.assigned_model = Some(model_id.clone());
                task.route_misses = 0;
                task.next_eligible_at = None;
                Some((task.specialty.clone(), task.payload.clone()))
            })
        };

        let Some((specialty, payload)) = launched else {
            // The task slipped into a terminal state; refund the reservation.
            let _ = self.quota.release(&model_id, cost);
            return;
        };

        info!(task_id = %task_id, model_id = %model_id, "Dispatched task");
        self.reporter.task_started(task_id, model_id.clone()).await;

        let token = CancellationToken::new();
        self.cancellations.lock().await.insert(task_id, token.clone());

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let order = WorkOrder::new(task_id.to_string(), specialty, payload);
            let started = Instant::now();
            let result = tokio::select! {
                () = token.cancelled() => Err(ExecutionError::Cancelled),
                result = inner.backend.execute(&model_id, order) => result,
            };
            inner
                .finish_execution(task_id, &model_id, cost, result, started.elapsed())
                .await;
        });
    }

    /// Settles one finished (or abandoned) execution.
    async fn finish_execution(
        self: &Arc<Self>,
        task_id: TaskId,
        model_id: &str,
        cost: u32,
        result: std::result::Result<scout_abstraction::WorkOutcome, ExecutionError>,
        latency: Duration,
    ) {
        self.cancellations.lock().await.remove(&task_id);

        // A task cancelled mid-flight is already terminal: discard whatever
        // the worker produced and refund the budget it never benefited from.
        let already_terminal = {
            let tasks = self.tasks.read().await;
            tasks.get(&task_id).is_none_or(|t| t.status.is_terminal())
        };
        if already_terminal {
            debug!(task_id = %task_id, "Discarding result for terminal task");
            if let Err(e) = self.quota.release(model_id, cost) {
                warn!(model_id = %model_id, error = %e, "Quota release failed");
            }
            self.wake.notify_one();
            return;
        }

        match result {
            Ok(_outcome) => {
                // The task may have been cancelled in the window since the
                // terminal check above; completion only lands on Running.
                let completed = {
                    let mut tasks = self.tasks.write().await;
                    tasks.get_mut(&task_id).is_some_and(|task| {
                        if task.status == TaskStatus::Running {
                            task.status = TaskStatus::Completed;
                            task.progress = 100;
                            true
                        } else {
                            false
                        }
                    })
                };

                if completed {
                    if let Err(e) = self.registry.record_outcome(model_id, true, latency) {
                        warn!(model_id = %model_id, error = %e, "Outcome recording failed");
                    }
                    info!(
                        task_id = %task_id,
                        model_id = %model_id,
                        latency_ms = latency.as_millis() as u64,
                        "Task completed"
                    );
                    self.reporter
                        .task_completed(task_id, model_id.to_string(), latency.as_millis() as u64)
                        .await;
                } else {
                    debug!(task_id = %task_id, "Discarding result for cancelled task");
                    if let Err(e) = self.quota.release(model_id, cost) {
                        warn!(model_id = %model_id, error = %e, "Quota release failed");
                    }
                }
            }
            Err(ExecutionError::Cancelled) => {
                // The backend itself reported cancellation.
                if let Err(e) = self.quota.release(model_id, cost) {
                    warn!(model_id = %model_id, error = %e, "Quota release failed");
                }
                self.fail_task(task_id, FailureReason::Cancelled).await;
            }
            Err(error) if error.is_transient() => {
                if let Err(e) = self.quota.release(model_id, cost) {
                    warn!(model_id = %model_id, error = %e, "Quota release failed");
                }
                if let Err(e) = self.registry.record_outcome(model_id, false, latency) {
                    warn!(model_id = %model_id, error = %e, "Outcome recording failed");
                }
                self.retry_or_fail(task_id, model_id, &error).await;
            }
            Err(error) => {
                // Malformed work can never succeed anywhere; the model is
                // not at fault, so its health is untouched.
                if let Err(e) = self.quota.release(model_id, cost) {
                    warn!(model_id = %model_id, error = %e, "Quota release failed");
                }
                self.fail_task(task_id, FailureReason::InvalidPayload(error.to_string()))
                    .await;
            }
        }

        self.wake.notify_one();
    }

    /// Requeues a failed attempt on a different model, or fails terminally
    /// once attempts are exhausted.
    async fn retry_or_fail(self: &Arc<Self>, task_id: TaskId, model_id: &str, error: &ExecutionError) {
        let requeued = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else { return };
            if task.status != TaskStatus::Running {
                return;
            }

            task.excluded_models.insert(model_id.to_string());

            if task.attempts >= self.config.max_attempts {
                task.status = TaskStatus::Failed;
                task.failure = Some(FailureReason::AttemptsExhausted(error.to_string()));
                None
            } else {
                task.status = TaskStatus::Queued;
                let delay = Task::backoff_delay(
                    task.attempts.saturating_sub(1),
                    self.config.retry_backoff_base,
                    self.config.retry_backoff_cap,
                );
                let at = Instant::now() + delay;
                task.next_eligible_at = Some(at);
                Some((task.priority, at, task.attempts))
            }
        };

        match requeued {
            Some((priority, at, attempts)) => {
                warn!(
                    task_id = %task_id,
                    failed_model = %model_id,
                    attempts = attempts,
                    error = %error,
                    "Attempt failed, requeueing on a different model"
                );
                self.queue.push_after(task_id, priority, Some(at)).await;
                self.reporter
                    .task_requeued(task_id, model_id.to_string(), attempts)
                    .await;
            }
            None => {
                warn!(
                    task_id = %task_id,
                    failed_model = %model_id,
                    error = %error,
                    "Attempts exhausted, task failed"
                );
                self.reporter
                    .task_failed(
                        task_id,
                        FailureReason::AttemptsExhausted(error.to_string()).to_string(),
                        true,
                    )
                    .await;
            }
        }
    }

    /// Terminates a non-terminal task with the given reason.
    async fn fail_task(self: &Arc<Self>, task_id: TaskId, reason: FailureReason) {
        let was_running = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else { return };
            if task.status.is_terminal() {
                return;
            }
            let was_running = task.status == TaskStatus::Running;
            task.status = TaskStatus::Failed;
            task.failure = Some(reason.clone());
            was_running
        };

        warn!(task_id = %task_id, reason = %reason, "Task failed");
        self.reporter.task_failed(task_id, reason.to_string(), was_running).await;
    }
}
