//! Durable task queue for workflow and activity tasks.
//!
//! The broker owns all workflow state: executions, their history and the
//! activity invocations scheduled by them. Workers lease tasks, run them
//! and report back; the broker applies the outcome atomically and decides
//! retries and timeouts.
//!
//! Two implementations share the same semantics:
//! - [`memory::InMemoryBroker`] keeps everything in process, for tests and
//!   single-node runs.
//! - [`postgres::PostgresBroker`] persists to PostgreSQL so executions
//!   survive worker restarts.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use fishsense_core::retry::ActivityOptions;
use fishsense_core::types::Timestamp;
use fishsense_core::workflow::{ActivityStatus, WorkflowStatus};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::history::{Command, Failure, HistoryEvent, WorkflowError};

pub use memory::InMemoryBroker;
pub use postgres::PostgresBroker;

/// How long a leased workflow task stays invisible to other pollers.
pub const WORKFLOW_TASK_LEASE: Duration = Duration::from_secs(10);

/// How long a failed workflow task waits before it is handed out again.
pub const WORKFLOW_TASK_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Error type synthesised when an attempt outlives its start-to-close
/// timeout.
pub const START_TO_CLOSE_ERROR_TYPE: &str = "StartToCloseTimeout";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("workflow {0} already has an open run")]
    AlreadyStarted(String),

    #[error("workflow run {0} not found")]
    NotFound(Uuid),

    #[error("workflow run {0} is already closed")]
    ExecutionClosed(Uuid),

    #[error("workflow task lease for run {0} is no longer held")]
    StaleLease(Uuid),

    #[error("invalid workflow task command: {0}")]
    InvalidCommand(String),

    #[error("run {run_id}: {message}")]
    InvalidTransition { run_id: Uuid, message: String },

    #[error("corrupt broker record: {0}")]
    Corrupt(String),

    #[error("payload encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Tasks and records
// ---------------------------------------------------------------------------

/// Identifies one run of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkflowHandle {
    pub workflow_id: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    /// Business identifier; only one open run may use it.
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
}

/// Proof of a workflow task lease, returned when reporting the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowTaskToken {
    pub run_id: Uuid,
    pub lease_id: Uuid,
    /// Newest history event the task was built from.
    pub last_event_id: u64,
}

/// A leased workflow task: the full history to replay.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub token: WorkflowTaskToken,
    pub handle: WorkflowHandle,
    pub workflow_type: String,
    pub input: Value,
    pub history: Vec<HistoryEvent>,
}

/// Identifies one attempt of an activity invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTaskToken {
    pub run_id: Uuid,
    pub activity_id: String,
    pub attempt: u32,
}

/// A started activity attempt.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub token: ActivityTaskToken,
    pub handle: WorkflowHandle,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
}

/// Snapshot of a workflow execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub handle: WorkflowHandle,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub closed_at: Option<Timestamp>,
}

/// Snapshot of one activity invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub activity_id: String,
    pub activity_type: String,
    pub status: ActivityStatus,
    pub attempt: u32,
    pub last_failure: Option<Failure>,
    pub result: Option<Value>,
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Create a run and schedule its first workflow task.
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<WorkflowHandle, BrokerError>;

    /// Lease the oldest due workflow task on `task_queue`.
    async fn poll_workflow_task(&self, task_queue: &str)
        -> Result<Option<WorkflowTask>, BrokerError>;

    /// Apply the commands of a workflow task and release its lease.
    async fn complete_workflow_task(
        &self,
        token: WorkflowTaskToken,
        commands: Vec<Command>,
    ) -> Result<(), BrokerError>;

    /// Release a lease without applying anything; the task is retried
    /// after [`WORKFLOW_TASK_RETRY_DELAY`].
    async fn fail_workflow_task(
        &self,
        token: WorkflowTaskToken,
        message: &str,
    ) -> Result<(), BrokerError>;

    /// Start the oldest due activity attempt on `task_queue`.
    async fn poll_activity_task(&self, task_queue: &str)
        -> Result<Option<ActivityTask>, BrokerError>;

    /// Record an attempt's result. Returns `false` if the attempt is no
    /// longer current (retried, timed out or cancelled) and the result was
    /// discarded.
    async fn complete_activity_task(
        &self,
        token: &ActivityTaskToken,
        result: Value,
    ) -> Result<bool, BrokerError>;

    /// Record an attempt's failure; retries per the activity's policy.
    /// Returns `false` if the attempt is no longer current.
    async fn fail_activity_task(
        &self,
        token: &ActivityTaskToken,
        failure: Failure,
    ) -> Result<bool, BrokerError>;

    /// Ask a run to cancel. The workflow sees the request on its next task.
    async fn request_cancel_workflow(&self, handle: &WorkflowHandle) -> Result<(), BrokerError>;

    /// Enforce activity timeouts. Returns how many invocations changed.
    async fn sweep_timeouts(&self) -> Result<usize, BrokerError>;

    async fn describe_workflow(&self, handle: &WorkflowHandle)
        -> Result<ExecutionRecord, BrokerError>;

    async fn list_activity_invocations(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<Vec<InvocationRecord>, BrokerError>;

    async fn history(&self, handle: &WorkflowHandle) -> Result<Vec<HistoryEvent>, BrokerError>;
}

// ---------------------------------------------------------------------------
// Shared decisions
// ---------------------------------------------------------------------------

/// Check a workflow task's commands before any of them is applied.
///
/// `is_known` reports whether an activity id is already scheduled.
pub(crate) fn validate_commands(
    commands: &[Command],
    is_known: impl Fn(&str) -> bool,
) -> Result<(), BrokerError> {
    let mut scheduled: Vec<&str> = Vec::new();
    for (i, command) in commands.iter().enumerate() {
        match command {
            Command::ScheduleActivity { activity_id, .. } => {
                if is_known(activity_id) || scheduled.contains(&activity_id.as_str()) {
                    return Err(BrokerError::InvalidCommand(format!(
                        "activity {activity_id} is already scheduled"
                    )));
                }
                scheduled.push(activity_id);
            }
            Command::RequestCancelActivity { activity_id } => {
                if !is_known(activity_id) && !scheduled.contains(&activity_id.as_str()) {
                    return Err(BrokerError::InvalidCommand(format!(
                        "cannot cancel unknown activity {activity_id}"
                    )));
                }
            }
            _ if command.is_terminal() && i + 1 != commands.len() => {
                return Err(BrokerError::InvalidCommand(
                    "a closing command must come last".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Terminal status and history event for a closing command.
pub(crate) fn close_outcome(command: &Command) -> Option<(WorkflowStatus, HistoryEvent)> {
    match command {
        Command::CompleteWorkflow { result } => Some((
            WorkflowStatus::Completed,
            HistoryEvent::WorkflowExecutionCompleted {
                result: result.clone(),
            },
        )),
        Command::FailWorkflow { error } if error.is_timeout() => Some((
            WorkflowStatus::TimedOut,
            HistoryEvent::WorkflowExecutionTimedOut {
                error: error.clone(),
            },
        )),
        Command::FailWorkflow { error } => Some((
            WorkflowStatus::Failed,
            HistoryEvent::WorkflowExecutionFailed {
                error: error.clone(),
            },
        )),
        Command::CancelWorkflow => Some((
            WorkflowStatus::Cancelled,
            HistoryEvent::WorkflowExecutionCancelled,
        )),
        _ => None,
    }
}

/// The stored result or error of a closed execution, from its close event.
pub(crate) fn close_payload(event: &HistoryEvent) -> (Option<Value>, Option<WorkflowError>) {
    match event {
        HistoryEvent::WorkflowExecutionCompleted { result } => (Some(result.clone()), None),
        HistoryEvent::WorkflowExecutionFailed { error }
        | HistoryEvent::WorkflowExecutionTimedOut { error } => (None, Some(error.clone())),
        HistoryEvent::WorkflowExecutionCancelled => (None, Some(WorkflowError::Cancelled)),
        _ => (None, None),
    }
}

pub(crate) fn check_workflow_transition(
    run_id: Uuid,
    from: WorkflowStatus,
    to: WorkflowStatus,
) -> Result<(), BrokerError> {
    from.validate_transition(to)
        .map_err(|message| BrokerError::InvalidTransition { run_id, message })
}

pub(crate) fn check_activity_transition(
    run_id: Uuid,
    from: ActivityStatus,
    to: ActivityStatus,
) -> Result<(), BrokerError> {
    from.validate_transition(to)
        .map_err(|message| BrokerError::InvalidTransition { run_id, message })
}

/// Backoff before the next attempt, or `None` if the failure is final.
pub(crate) fn retry_delay(
    options: &ActivityOptions,
    attempt: u32,
    failure: &Failure,
) -> Option<Duration> {
    let policy = &options.retry_policy;
    policy
        .should_retry(attempt, &failure.error_type, failure.non_retryable)
        .then(|| policy.delay_after_attempt(attempt))
}

pub(crate) fn start_to_close_failure(timeout: Option<Duration>) -> Failure {
    Failure {
        message: match timeout {
            Some(t) => format!("attempt exceeded its start-to-close timeout of {t:?}"),
            None => "attempt exceeded its start-to-close timeout".to_string(),
        },
        error_type: START_TO_CLOSE_ERROR_TYPE.to_string(),
        non_retryable: false,
    }
}
