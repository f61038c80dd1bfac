//! The PostgreSQL broker against a live database.
//!
//! Need a PostgreSQL server reachable through `DATABASE_URL`; run with
//! `cargo test -p fishsense-pipeline -- --ignored`.

use std::time::Duration;

use assert_matches::assert_matches;
use fishsense_core::retry::{ActivityOptions, RetryPolicy};
use fishsense_core::workflow::{ActivityStatus, WorkflowStatus};
use fishsense_pipeline::broker::{StartWorkflowRequest, TaskQueue};
use fishsense_pipeline::{BrokerError, Command, Failure, HistoryEvent, PostgresBroker, WorkflowError};
use serde_json::json;
use sqlx::PgPool;

const QUEUE: &str = "test_queue";

fn request(workflow_id: &str) -> StartWorkflowRequest {
    StartWorkflowRequest {
        workflow_id: workflow_id.into(),
        workflow_type: "DiveFrameClusteringWorkflow".into(),
        task_queue: QUEUE.into(),
        input: json!({ "images": [] }),
    }
}

fn schedule(options: ActivityOptions) -> Command {
    Command::ScheduleActivity {
        activity_id: "1".into(),
        activity_type: "cluster_dive_frames".into(),
        input: json!([]),
        options,
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn happy_path_round_trip(pool: PgPool) {
    let broker = PostgresBroker::new(pool);
    let handle = broker.start_workflow(request("dive-1")).await.unwrap();
    assert_matches!(
        broker.start_workflow(request("dive-1")).await,
        Err(BrokerError::AlreadyStarted(_))
    );

    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    assert_eq!(task.token.last_event_id, 1);
    broker
        .complete_workflow_task(task.token, vec![schedule(ActivityOptions::default())])
        .await
        .unwrap();
    assert!(broker.poll_workflow_task(QUEUE).await.unwrap().is_none());

    let activity = broker.poll_activity_task(QUEUE).await.unwrap().unwrap();
    assert_eq!(activity.handle, handle);
    assert!(broker.complete_activity_task(&activity.token, json!([[1, 2]])).await.unwrap());
    assert!(!broker.complete_activity_task(&activity.token, json!([])).await.unwrap());

    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    assert_eq!(task.history.len(), 3);
    broker
        .complete_workflow_task(task.token, vec![Command::CompleteWorkflow { result: json!([[1, 2]]) }])
        .await
        .unwrap();

    let record = broker.describe_workflow(&handle).await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Completed);
    assert_eq!(record.result, Some(json!([[1, 2]])));
    assert_matches!(
        broker.history(&handle).await.unwrap().last(),
        Some(HistoryEvent::WorkflowExecutionCompleted { .. })
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn failures_retry_then_close_the_invocation(pool: PgPool) {
    let broker = PostgresBroker::new(pool);
    let handle = broker.start_workflow(request("dive-1")).await.unwrap();
    let options = ActivityOptions {
        retry_policy: RetryPolicy {
            initial_interval: Duration::ZERO,
            maximum_attempts: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    broker.complete_workflow_task(task.token, vec![schedule(options)]).await.unwrap();

    let failure = Failure {
        message: "reset".into(),
        error_type: "Io".into(),
        non_retryable: false,
    };
    let first = broker.poll_activity_task(QUEUE).await.unwrap().unwrap();
    assert!(broker.fail_activity_task(&first.token, failure.clone()).await.unwrap());
    let second = broker.poll_activity_task(QUEUE).await.unwrap().unwrap();
    assert_eq!(second.token.attempt, 2);
    assert!(broker.fail_activity_task(&second.token, failure.clone()).await.unwrap());

    let invocations = broker.list_activity_invocations(&handle).await.unwrap();
    assert_eq!(invocations[0].status, ActivityStatus::Failed);
    assert_eq!(invocations[0].last_failure, Some(failure));

    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    assert_matches!(
        task.history.last(),
        Some(HistoryEvent::ActivityTaskFailed { attempt: 2, .. })
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn cancellation_closes_open_invocations(pool: PgPool) {
    let broker = PostgresBroker::new(pool);
    let handle = broker.start_workflow(request("dive-1")).await.unwrap();
    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    broker
        .complete_workflow_task(task.token, vec![schedule(ActivityOptions::default())])
        .await
        .unwrap();
    let activity = broker.poll_activity_task(QUEUE).await.unwrap().unwrap();

    broker.request_cancel_workflow(&handle).await.unwrap();
    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    broker
        .complete_workflow_task(
            task.token,
            vec![
                Command::RequestCancelActivity { activity_id: "1".into() },
                Command::CancelWorkflow,
            ],
        )
        .await
        .unwrap();

    assert!(!broker.complete_activity_task(&activity.token, json!([])).await.unwrap());
    let record = broker.describe_workflow(&handle).await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Cancelled);
    assert_eq!(record.error, Some(WorkflowError::Cancelled));
    let invocations = broker.list_activity_invocations(&handle).await.unwrap();
    assert_eq!(invocations[0].status, ActivityStatus::Cancelled);
    assert_matches!(
        broker.request_cancel_workflow(&handle).await,
        Err(BrokerError::ExecutionClosed(_))
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn sweeper_times_out_expired_invocations(pool: PgPool) {
    let broker = PostgresBroker::new(pool);
    let handle = broker.start_workflow(request("dive-1")).await.unwrap();
    let options = ActivityOptions {
        schedule_to_close_timeout: Duration::ZERO,
        ..Default::default()
    };
    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    broker.complete_workflow_task(task.token, vec![schedule(options)]).await.unwrap();

    assert_eq!(broker.sweep_timeouts().await.unwrap(), 1);
    assert_eq!(broker.sweep_timeouts().await.unwrap(), 0);
    assert!(broker.poll_activity_task(QUEUE).await.unwrap().is_none());

    let invocations = broker.list_activity_invocations(&handle).await.unwrap();
    assert_eq!(invocations[0].status, ActivityStatus::TimedOut);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn closed_runs_keep_their_status(pool: PgPool) {
    let broker = PostgresBroker::new(pool);
    let handle = broker.start_workflow(request("dive-1")).await.unwrap();
    let task = broker.poll_workflow_task(QUEUE).await.unwrap().unwrap();
    let token = task.token.clone();
    broker
        .complete_workflow_task(task.token, vec![Command::CompleteWorkflow { result: json!([]) }])
        .await
        .unwrap();

    assert!(broker
        .complete_workflow_task(token, vec![Command::FailWorkflow { error: WorkflowError::Cancelled }])
        .await
        .is_err());
    assert!(broker.sweep_timeouts().await.is_ok());
    let record = broker.describe_workflow(&handle).await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Completed);
    assert_eq!(record.result, Some(json!([])));
}
