//! End-to-end workflow tests: DAG propagation, aggregation, cancellation,
//! and quota-constrained progress.

use async_trait::async_trait;
use scout_abstraction::{ExecutionError, WorkOrder, WorkOutcome, WorkerBackend};
use scout_orchestrator::{
    EchoWorker, ModelDefinition, ModelTier, Orchestrator, OrchestratorConfig, StepDefinition,
    StepFailure, StepStatus, TaskStatus, WorkflowId, WorkflowStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker that fails any order whose payload carries `"fail": true`.
struct MarkerWorker;

#[async_trait]
impl WorkerBackend for MarkerWorker {
    async fn execute(
        &self,
        model_id: &str,
        order: WorkOrder,
    ) -> Result<WorkOutcome, ExecutionError> {
        if order.payload.get("fail").and_then(serde_json::Value::as_bool) == Some(true) {
            return Err(ExecutionError::WorkerResponseError("scripted failure".to_string()));
        }
        Ok(WorkOutcome { output: order.payload, worker_id: Some(model_id.to_string()) })
    }
}

fn fast_config(models: Vec<ModelDefinition>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(models);
    config.scheduler.tick_interval = Duration::from_millis(10);
    config.scheduler.retry_backoff_base = Duration::from_millis(10);
    config.scheduler.retry_backoff_cap = Duration::from_millis(50);
    config
}

fn two_model_pool() -> Vec<ModelDefinition> {
    vec![
        ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize"),
        ModelDefinition::new("pathfinder-1", ModelTier::Secondary, "summarize"),
    ]
}

async fn wait_for_workflow(
    orchestrator: &Orchestrator,
    workflow_id: WorkflowId,
    status: WorkflowStatus,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = orchestrator.workflow_status(workflow_id).await.unwrap();
        if snapshot.status == status {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {status:?}, workflow at {:?}",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn chain_workflow_completes_in_dependency_order() {
    let orchestrator = Orchestrator::new(fast_config(two_model_pool()), Arc::new(EchoWorker::new()));
    orchestrator.start().unwrap();

    let workflow_id = orchestrator
        .start_workflow(vec![
            StepDefinition::new("fetch", "summarize"),
            StepDefinition::new("digest", "summarize").depends_on("fetch"),
            StepDefinition::new("publish", "summarize").depends_on("digest"),
        ])
        .await
        .unwrap();

    wait_for_workflow(&orchestrator, workflow_id, WorkflowStatus::Completed, Duration::from_secs(3))
        .await;

    let snapshot = orchestrator.workflow_status(workflow_id).await.unwrap();
    assert_eq!(snapshot.progress, 100);
    assert!(snapshot.steps.iter().all(|s| s.status == StepStatus::Completed));

    orchestrator.shutdown();
}

#[tokio::test]
async fn failed_step_skips_all_downstream_steps() {
    let orchestrator = Orchestrator::new(fast_config(two_model_pool()), Arc::new(MarkerWorker));
    orchestrator.start().unwrap();

    // A fails terminally; B depends on A, C depends on B.
    let workflow_id = orchestrator
        .start_workflow(vec![
            StepDefinition::new("a", "summarize")
                .with_payload(serde_json::json!({"fail": true})),
            StepDefinition::new("b", "summarize").depends_on("a"),
            StepDefinition::new("c", "summarize").depends_on("b"),
        ])
        .await
        .unwrap();

    wait_for_workflow(&orchestrator, workflow_id, WorkflowStatus::Failed, Duration::from_secs(5))
        .await;

    let snapshot = orchestrator.workflow_status(workflow_id).await.unwrap();
    let step = |id: &str| snapshot.steps.iter().find(|s| s.id == id).unwrap();

    assert_eq!(step("a").status, StepStatus::Failed);
    assert!(matches!(step("a").failure, Some(StepFailure::Direct(_))));

    // Cascade is surfaced distinctly from the root cause.
    assert_eq!(step("b").status, StepStatus::Skipped);
    assert_eq!(
        step("b").failure,
        Some(StepFailure::DependencyFailed { upstream: "a".to_string() })
    );
    assert_eq!(step("c").status, StepStatus::Skipped);
    assert_eq!(
        step("c").failure,
        Some(StepFailure::DependencyFailed { upstream: "b".to_string() })
    );

    orchestrator.shutdown();
}

#[tokio::test]
async fn independent_branch_survives_sibling_failure() {
    let orchestrator = Orchestrator::new(fast_config(two_model_pool()), Arc::new(MarkerWorker));
    orchestrator.start().unwrap();

    let workflow_id = orchestrator
        .start_workflow(vec![
            StepDefinition::new("doomed", "summarize")
                .with_payload(serde_json::json!({"fail": true})),
            StepDefinition::new("fine", "summarize"),
            StepDefinition::new("downstream", "summarize").depends_on("fine"),
        ])
        .await
        .unwrap();

    wait_for_workflow(&orchestrator, workflow_id, WorkflowStatus::Failed, Duration::from_secs(5))
        .await;

    let snapshot = orchestrator.workflow_status(workflow_id).await.unwrap();
    let step = |id: &str| snapshot.steps.iter().find(|s| s.id == id).unwrap();

    // The independent branch ran to completion even though the workflow
    // as a whole is failed.
    assert_eq!(step("fine").status, StepStatus::Completed);
    assert_eq!(step("downstream").status, StepStatus::Completed);
    assert_eq!(step("doomed").status, StepStatus::Failed);

    orchestrator.shutdown();
}

#[tokio::test]
async fn diamond_join_waits_for_both_parents() {
    let orchestrator = Orchestrator::new(fast_config(two_model_pool()), Arc::new(EchoWorker::new()));
    orchestrator.start().unwrap();

    let workflow_id = orchestrator
        .start_workflow(vec![
            StepDefinition::new("root", "summarize"),
            StepDefinition::new("left", "summarize").depends_on("root"),
            StepDefinition::new("right", "summarize").depends_on("root"),
            StepDefinition::new("join", "summarize").depends_on("left").depends_on("right"),
        ])
        .await
        .unwrap();

    wait_for_workflow(&orchestrator, workflow_id, WorkflowStatus::Completed, Duration::from_secs(3))
        .await;

    let snapshot = orchestrator.workflow_status(workflow_id).await.unwrap();
    assert!(snapshot.steps.iter().all(|s| s.status == StepStatus::Completed));

    orchestrator.shutdown();
}

#[tokio::test]
async fn workflow_status_is_idempotent_without_new_events() {
    let orchestrator = Orchestrator::new(fast_config(two_model_pool()), Arc::new(EchoWorker::new()));
    orchestrator.start().unwrap();

    let workflow_id = orchestrator
        .start_workflow(vec![
            StepDefinition::new("a", "summarize"),
            StepDefinition::new("b", "summarize").depends_on("a"),
        ])
        .await
        .unwrap();

    wait_for_workflow(&orchestrator, workflow_id, WorkflowStatus::Completed, Duration::from_secs(3))
        .await;
    orchestrator.shutdown();

    // Terminal workflow, loops stopped: repeated reads must agree exactly.
    let first = orchestrator.workflow_status(workflow_id).await.unwrap();
    for _ in 0..5 {
        let again = orchestrator.workflow_status(workflow_id).await.unwrap();
        assert_eq!(again.status, first.status);
        assert_eq!(again.progress, first.progress);
        let statuses: Vec<StepStatus> = again.steps.iter().map(|s| s.status).collect();
        let expected: Vec<StepStatus> = first.steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, expected);
    }
}

#[tokio::test]
async fn cancel_workflow_stops_pending_and_running_steps() {
    let orchestrator = Orchestrator::new(
        fast_config(two_model_pool()),
        Arc::new(EchoWorker::with_delay(Duration::from_millis(500))),
    );
    orchestrator.start().unwrap();

    let workflow_id = orchestrator
        .start_workflow(vec![
            StepDefinition::new("slow", "summarize"),
            StepDefinition::new("after", "summarize").depends_on("slow"),
        ])
        .await
        .unwrap();

    // Let the first step reach its worker, then cancel everything.
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.cancel_workflow(workflow_id).await.unwrap();

    let snapshot = orchestrator.workflow_status(workflow_id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
    let step = |id: &str| snapshot.steps.iter().find(|s| s.id == id).unwrap();
    assert_eq!(step("slow").status, StepStatus::Failed);
    assert_eq!(step("after").status, StepStatus::Skipped);

    // The underlying task is cancelled as well (best effort).
    let task_id = step("slow").task_id.unwrap();
    let task = orchestrator.task_status(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    orchestrator.shutdown();
}

#[tokio::test]
async fn two_steps_share_one_quota_slot_across_windows() {
    // Pool: exactly one healthy model with budget for a single unit per
    // (short) window. Two independent steps must serialize across windows
    // while the workflow stays `Running` throughout.
    let orchestrator = Orchestrator::new(
        fast_config(vec![ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize")
            .with_quota_limit(1)
            .with_quota_window(Duration::from_millis(300))]),
        Arc::new(EchoWorker::new()),
    );
    orchestrator.start().unwrap();

    let workflow_id = orchestrator
        .start_workflow(vec![
            StepDefinition::new("one", "summarize"),
            StepDefinition::new("two", "summarize"),
        ])
        .await
        .unwrap();

    // Shortly after start, exactly one underlying task has gotten through
    // admission; the other is still queued behind the quota window.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = orchestrator.workflow_status(workflow_id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Running);

    let mut completed = 0;
    let mut queued = 0;
    for step in &snapshot.steps {
        let task = orchestrator.task_status(step.task_id.unwrap()).await.unwrap();
        match task.status {
            TaskStatus::Completed => completed += 1,
            TaskStatus::Queued => queued += 1,
            other => panic!("unexpected task status {other:?}"),
        }
    }
    assert_eq!(completed, 1, "one unit of budget admits exactly one task");
    assert_eq!(queued, 1, "the other task waits for the window to reset");

    // Quota invariant holds while we wait.
    let atlas = orchestrator.list_models().into_iter().find(|m| m.id == "atlas-1").unwrap();
    assert!(atlas.quota_used <= atlas.quota_limit);

    // After the window rolls, the second step completes and the workflow
    // reaches `Completed`.
    wait_for_workflow(&orchestrator, workflow_id, WorkflowStatus::Completed, Duration::from_secs(4))
        .await;

    orchestrator.shutdown();
}

#[tokio::test]
async fn workflow_fails_when_step_exhausts_every_candidate() {
    let orchestrator = Orchestrator::new(fast_config(two_model_pool()), Arc::new(MarkerWorker));
    orchestrator.start().unwrap();

    // Both models fail this payload; after both are tried the step's task
    // fails terminally and the workflow follows.
    let workflow_id = orchestrator
        .start_workflow(vec![StepDefinition::new("stubborn", "summarize")
            .with_payload(serde_json::json!({"fail": true}))])
        .await
        .unwrap();

    wait_for_workflow(&orchestrator, workflow_id, WorkflowStatus::Failed, Duration::from_secs(5))
        .await;

    orchestrator.shutdown();
}
