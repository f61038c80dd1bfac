//! Worker runtime.
//!
//! Three long-lived loops share one broker: a workflow-task poller, an
//! activity-task poller and a timeout sweeper. Each poll cycle claims tasks
//! while a permit is free and runs each task on its own Tokio task, so at
//! most `max_workers` workflow replays and activity attempts run at once.
//! Cancelling the shutdown token stops the loops; tasks already claimed
//! are allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use fishsense_pipeline::activity::run_activity;
use fishsense_pipeline::broker::{ActivityTask, WorkflowTask};
use fishsense_pipeline::{
    replay, ActivityContext, ActivityError, ActivityRegistry, BrokerError, TaskQueue,
    WorkflowRegistry,
};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Default interval between poll cycles.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default interval between timeout sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Error type recorded when no activity is registered under a type name.
pub const UNKNOWN_ACTIVITY_ERROR: &str = "ActivityNotRegistered";

/// Executes workflow and activity tasks from one task queue.
pub struct Worker {
    broker: Arc<dyn TaskQueue>,
    task_queue: String,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    max_workers: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn TaskQueue>,
        task_queue: impl Into<String>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        max_workers: usize,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            broker,
            task_queue: task_queue.into(),
            workflows,
            activities,
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            tracker: TaskTracker::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Run until `shutdown` is cancelled, then wait for in-flight tasks.
    pub async fn run(self, shutdown: CancellationToken) {
        let worker = Arc::new(self);
        tracing::info!(
            task_queue = %worker.task_queue,
            max_workers = worker.max_workers,
            workflows = ?worker.workflows.names(),
            activities = ?worker.activities.names(),
            "Worker started",
        );

        let loops = [
            tokio::spawn(worker.clone().poll_workflow_tasks(shutdown.clone())),
            tokio::spawn(worker.clone().poll_activity_tasks(shutdown.clone())),
            tokio::spawn(worker.clone().sweep_timeouts(shutdown)),
        ];
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker loop panicked");
            }
        }

        worker.tracker.close();
        tracing::info!(in_flight = worker.tracker.len(), "Draining in-flight tasks");
        worker.tracker.wait().await;
        tracing::info!("Worker stopped");
    }

    // -----------------------------------------------------------------------
    // Workflow tasks
    // -----------------------------------------------------------------------

    async fn poll_workflow_tasks(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Workflow task poller started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Workflow task poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.clone().dispatch_workflow_tasks().await {
                        tracing::error!(error = %e, "Workflow poll cycle failed");
                    }
                }
            }
        }
    }

    /// Claim workflow tasks until the queue is empty or no permit is free.
    async fn dispatch_workflow_tasks(self: Arc<Self>) -> Result<(), BrokerError> {
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                return Ok(());
            };
            let Some(task) = self.broker.poll_workflow_task(&self.task_queue).await? else {
                return Ok(());
            };
            let worker = self.clone();
            self.tracker.spawn(async move {
                worker.process_workflow_task(task).await;
                drop(permit);
            });
        }
    }

    async fn process_workflow_task(&self, task: WorkflowTask) {
        let run_id = task.handle.run_id;
        let outcome = match replay(&self.workflows, &task) {
            Ok(commands) => {
                tracing::debug!(
                    %run_id,
                    workflow_type = %task.workflow_type,
                    events = task.history.len(),
                    commands = commands.len(),
                    "Workflow task replayed",
                );
                self.broker.complete_workflow_task(task.token, commands).await
            }
            Err(e) => {
                tracing::warn!(%run_id, workflow_type = %task.workflow_type, error = %e, "Workflow task failed");
                self.broker.fail_workflow_task(task.token, &e.to_string()).await
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(%run_id, error = %e, "Could not record workflow task outcome");
        }
    }

    // -----------------------------------------------------------------------
    // Activity tasks
    // -----------------------------------------------------------------------

    async fn poll_activity_tasks(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Activity task poller started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Activity task poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.clone().dispatch_activity_tasks().await {
                        tracing::error!(error = %e, "Activity poll cycle failed");
                    }
                }
            }
        }
    }

    async fn dispatch_activity_tasks(self: Arc<Self>) -> Result<(), BrokerError> {
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                return Ok(());
            };
            let Some(task) = self.broker.poll_activity_task(&self.task_queue).await? else {
                return Ok(());
            };
            let worker = self.clone();
            self.tracker.spawn(async move {
                worker.process_activity_task(task).await;
                drop(permit);
            });
        }
    }

    async fn process_activity_task(&self, task: ActivityTask) {
        let ActivityTask {
            token,
            handle,
            activity_type,
            input,
            ..
        } = task;

        let outcome = match self.activities.get(&activity_type) {
            Some(activity) => {
                let ctx = ActivityContext {
                    workflow: handle.clone(),
                    activity_id: token.activity_id.clone(),
                    attempt: token.attempt,
                };
                run_activity(activity, ctx, input).await
            }
            None => Err(ActivityError::non_retryable(
                UNKNOWN_ACTIVITY_ERROR,
                format!("no activity registered for type {activity_type}"),
            )),
        };

        let recorded = match outcome {
            Ok(result) => self.broker.complete_activity_task(&token, result).await,
            Err(e) => {
                tracing::warn!(
                    run_id = %handle.run_id,
                    activity_id = %token.activity_id,
                    activity_type,
                    attempt = token.attempt,
                    error = %e,
                    "Activity attempt failed",
                );
                self.broker.fail_activity_task(&token, e.into()).await
            }
        };
        match recorded {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                run_id = %handle.run_id,
                activity_id = %token.activity_id,
                attempt = token.attempt,
                "Discarded outcome of a superseded attempt",
            ),
            Err(e) => tracing::warn!(
                run_id = %handle.run_id,
                activity_id = %token.activity_id,
                error = %e,
                "Could not record activity outcome",
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    async fn sweep_timeouts(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            "Timeout sweeper started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Timeout sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.broker.sweep_timeouts().await {
                        Ok(0) => {}
                        Ok(expired) => tracing::debug!(expired, "Expired activity deadlines"),
                        Err(e) => tracing::error!(error = %e, "Timeout sweep failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use fishsense_core::image::{DiveRef, ImageRef, Priority};
    use fishsense_core::retry::{ActivityOptions, RetryPolicy};
    use fishsense_core::workflow::{ActivityStatus, WorkflowStatus};
    use fishsense_pipeline::activities::{ClusterDiveFramesActivity, CLUSTER_DIVE_FRAMES};
    use fishsense_pipeline::activity::DECODE_ERROR;
    use fishsense_pipeline::broker::{StartWorkflowRequest, WorkflowHandle};
    use fishsense_pipeline::workflows::{DiveFrameClusteringWorkflow, DIVE_FRAME_CLUSTERING};
    use fishsense_pipeline::{
        default_registries, Activity, ActivityFailure, ClientError, HistoryEvent, InMemoryBroker,
        TimeoutKind, Workflow, WorkflowClient, WorkflowContext, WorkflowError, TASK_QUEUE,
    };
    use futures::future::BoxFuture;
    use serde_json::{json, Value};
    use tokio::time::Instant;

    fn dive() -> DiveRef {
        DiveRef {
            id: 3,
            name: None,
            path: "2024.05.02/dive3".into(),
            dive_datetime: None,
            priority: Priority::High,
            flip_dive_slate: false,
            camera_id: Some(1),
            dive_slate_id: None,
        }
    }

    fn images() -> Vec<ImageRef> {
        [0, 1, 2, 40, 41]
            .into_iter()
            .enumerate()
            .map(|(i, second)| ImageRef {
                id: i as i64 + 1,
                path: format!("P{:03}.ORF", i + 1),
                taken_at: Some(Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, second).unwrap()),
                checksum: format!("{i:032}"),
                dive_id: Some(3),
            })
            .collect()
    }

    fn ids(clusters: &[Vec<ImageRef>]) -> Vec<Vec<i64>> {
        clusters.iter().map(|c| c.iter().map(|i| i.id).collect()).collect()
    }

    /// Start a worker in the background; cancel the returned token to stop it.
    fn spawn_worker(
        broker: Arc<InMemoryBroker>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let shutdown = CancellationToken::new();
        let worker = Worker::new(broker, TASK_QUEUE, workflows, activities, 8)
            .with_poll_interval(Duration::from_millis(50))
            .with_sweep_interval(Duration::from_millis(500));
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        (shutdown, handle)
    }

    fn client(broker: Arc<InMemoryBroker>) -> WorkflowClient {
        WorkflowClient::new(broker, TASK_QUEUE).with_poll_interval(Duration::from_millis(20))
    }

    /// Clustering activity that fails with a transient error until its
    /// third attempt.
    struct Flaky {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Activity for Flaky {
        fn name(&self) -> &'static str {
            CLUSTER_DIVE_FRAMES
        }

        async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt < 3 {
                return Err(ActivityError::retryable("ConnectionReset", "storage unavailable"));
            }
            ClusterDiveFramesActivity.execute(ctx, input).await
        }
    }

    /// The real clustering activity, noting when each attempt starts.
    struct Timed {
        starts: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Activity for Timed {
        fn name(&self) -> &'static str {
            CLUSTER_DIVE_FRAMES
        }

        async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
            self.starts.lock().unwrap().push(Instant::now());
            ClusterDiveFramesActivity.execute(ctx, input).await
        }
    }

    /// Activity that never finishes on its own.
    struct Hangs;

    #[async_trait]
    impl Activity for Hangs {
        fn name(&self) -> &'static str {
            "hangs"
        }

        async fn execute(&self, _ctx: ActivityContext, _input: Value) -> Result<Value, ActivityError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!([]))
        }
    }

    /// Workflow that calls [`Hangs`] once with the given options.
    struct AwaitsHang {
        options: ActivityOptions,
    }

    impl Workflow for AwaitsHang {
        fn name(&self) -> &'static str {
            "AwaitsHang"
        }

        fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, Result<Value, WorkflowError>> {
            let options = self.options.clone();
            Box::pin(async move { Ok(ctx.execute_activity("hangs", input, options).await?) })
        }
    }

    async fn start_hang(broker: &InMemoryBroker) -> WorkflowHandle {
        broker
            .start_workflow(StartWorkflowRequest {
                workflow_id: "awaits-hang".into(),
                workflow_type: "AwaitsHang".into(),
                task_queue: TASK_QUEUE.into(),
                input: json!([]),
            })
            .await
            .unwrap()
    }

    fn hang_registries(options: ActivityOptions) -> (WorkflowRegistry, ActivityRegistry) {
        let mut workflows = WorkflowRegistry::new();
        workflows.register(AwaitsHang { options });
        let mut activities = ActivityRegistry::new();
        activities.register(Hangs);
        (workflows, activities)
    }

    #[tokio::test(start_paused = true)]
    async fn clusters_a_dive_end_to_end() {
        let broker = Arc::new(InMemoryBroker::new());
        let (workflows, activities) = default_registries();
        let (shutdown, worker) = spawn_worker(broker.clone(), workflows, activities);

        let client = client(broker);
        let handle = client.start_dive_frame_clustering(&dive(), &images()).await.unwrap();
        let clusters = client.result(&handle).await.unwrap();
        assert_eq!(ids(&clusters), vec![vec![1, 2, 3], vec![4, 5]]);

        let invocations = client.activity_invocations(&handle).await.unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].status, ActivityStatus::Completed);
        assert_eq!(invocations[0].attempt, 1);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicU32::new(0));
        let mut workflows = WorkflowRegistry::new();
        workflows.register(DiveFrameClusteringWorkflow);
        let mut activities = ActivityRegistry::new();
        activities.register(Flaky { calls: calls.clone() });
        let (shutdown, worker) = spawn_worker(broker.clone(), workflows, activities);

        let client = client(broker);
        let handle = client.start_dive_frame_clustering(&dive(), &images()).await.unwrap();
        let clusters = client.result(&handle).await.unwrap();
        assert_eq!(ids(&clusters), vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let invocations = client.activity_invocations(&handle).await.unwrap();
        assert_eq!(invocations[0].status, ActivityStatus::Completed);
        assert_eq!(invocations[0].attempt, 3);
        let history = client.history(&handle).await.unwrap();
        assert!(!history
            .iter()
            .any(|e| matches!(e, HistoryEvent::ActivityTaskFailed { .. })));

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_start_to_close_retries_fails_the_run() {
        let broker = Arc::new(InMemoryBroker::new());
        let options = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_secs(5)),
            retry_policy: RetryPolicy {
                maximum_attempts: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let (workflows, activities) = hang_registries(options);
        let (shutdown, worker) = spawn_worker(broker.clone(), workflows, activities);

        let handle = start_hang(&broker).await;
        let err = client(broker.clone()).result(&handle).await.unwrap_err();
        assert_matches!(
            err,
            ClientError::Workflow {
                status: WorkflowStatus::Failed,
                error: WorkflowError::Activity(ActivityFailure::TimedOut {
                    attempt: 3,
                    kind: TimeoutKind::StartToClose,
                    ..
                }),
            }
        );

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_to_close_expiry_times_out_the_run() {
        let broker = Arc::new(InMemoryBroker::new());
        let options = ActivityOptions {
            schedule_to_close_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let (workflows, activities) = hang_registries(options);
        let (shutdown, worker) = spawn_worker(broker.clone(), workflows, activities);

        let handle = start_hang(&broker).await;
        let err = client(broker.clone()).result(&handle).await.unwrap_err();
        assert_matches!(
            err,
            ClientError::Workflow {
                status: WorkflowStatus::TimedOut,
                error: WorkflowError::Activity(ActivityFailure::TimedOut {
                    kind: TimeoutKind::ScheduleToClose,
                    ..
                }),
            }
        );
        let invocations = broker.list_activity_invocations(&handle).await.unwrap();
        assert_eq!(invocations[0].status, ActivityStatus::TimedOut);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_running_activity_cancels_the_run() {
        let broker = Arc::new(InMemoryBroker::new());
        let (workflows, activities) = hang_registries(ActivityOptions::default());
        let (shutdown, worker) = spawn_worker(broker.clone(), workflows, activities);

        let handle = start_hang(&broker).await;
        let client = client(broker.clone());
        loop {
            let invocations = client.activity_invocations(&handle).await.unwrap();
            if invocations.first().map(|i| i.status) == Some(ActivityStatus::Started) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        client.cancel(&handle).await.unwrap();
        assert_matches!(
            client.result(&handle).await,
            Err(ClientError::Workflow {
                status: WorkflowStatus::Cancelled,
                error: WorkflowError::Cancelled,
            })
        );
        let invocations = client.activity_invocations(&handle).await.unwrap();
        assert_eq!(invocations[0].status, ActivityStatus::Cancelled);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_activities_fail_without_retry() {
        let broker = Arc::new(InMemoryBroker::new());
        let (workflows, _) = hang_registries(ActivityOptions::default());
        let (shutdown, worker) = spawn_worker(broker.clone(), workflows, ActivityRegistry::new());

        let handle = start_hang(&broker).await;
        let err = client(broker.clone()).result(&handle).await.unwrap_err();
        assert_matches!(
            err,
            ClientError::Workflow {
                status: WorkflowStatus::Failed,
                error: WorkflowError::Activity(ActivityFailure::Failed { attempt: 1, ref failure, .. }),
            } if failure.error_type == UNKNOWN_ACTIVITY_ERROR
        );

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_images_are_retried_with_backoff() {
        let broker = Arc::new(InMemoryBroker::new());
        let starts = Arc::new(Mutex::new(Vec::new()));
        let mut workflows = WorkflowRegistry::new();
        workflows.register(DiveFrameClusteringWorkflow);
        let mut activities = ActivityRegistry::new();
        activities.register(Timed { starts: starts.clone() });
        let (shutdown, worker) = spawn_worker(broker.clone(), workflows, activities);

        let handle = broker
            .start_workflow(StartWorkflowRequest {
                workflow_id: "dive-frame-clustering-3".into(),
                workflow_type: DIVE_FRAME_CLUSTERING.into(),
                task_queue: TASK_QUEUE.into(),
                input: json!({ "dive": 3, "images": "nope" }),
            })
            .await
            .unwrap();
        let err = client(broker.clone()).result(&handle).await.unwrap_err();
        assert_matches!(
            err,
            ClientError::Workflow {
                status: WorkflowStatus::Failed,
                error: WorkflowError::Activity(ActivityFailure::Failed { attempt: 5, ref failure, .. }),
            } if failure.error_type == DECODE_ERROR && !failure.non_retryable
        );

        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 5);
        for (gap, backoff) in starts.windows(2).zip([1, 2, 4, 8]) {
            let gap = gap[1] - gap[0];
            let backoff = Duration::from_secs(backoff);
            assert!(gap >= backoff, "{gap:?} < {backoff:?}");
            assert!(gap < backoff + Duration::from_millis(500), "{gap:?} >> {backoff:?}");
        }
        let invocations = broker.list_activity_invocations(&handle).await.unwrap();
        assert_eq!(invocations[0].status, ActivityStatus::Failed);
        assert_eq!(invocations[0].attempt, 5);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_an_idle_worker() {
        let broker = Arc::new(InMemoryBroker::new());
        let (workflows, activities) = default_registries();
        let (shutdown, worker) = spawn_worker(broker, workflows, activities);
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        worker.await.unwrap();
    }
}
