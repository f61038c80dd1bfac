//! Workflow history events, the commands a workflow task produces, and the
//! failure types recorded in both.
//!
//! History is append-only. A workflow is rebuilt by replaying its history,
//! so every event carries what replay needs to resolve an activity call
//! without running it again.

use fishsense_core::retry::ActivityOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// An error reported by one activity attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    /// Matched against `RetryPolicy::non_retryable_error_types`.
    pub error_type: String,
    #[serde(default)]
    pub non_retryable: bool,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    ScheduleToClose,
    StartToClose,
}

/// Why an activity call produced no result.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityFailure {
    #[error("activity {activity_type} failed on attempt {attempt}: {failure}")]
    Failed {
        activity_id: String,
        activity_type: String,
        attempt: u32,
        failure: Failure,
    },
    #[error("activity {activity_type} timed out ({kind:?}) on attempt {attempt}")]
    TimedOut {
        activity_id: String,
        activity_type: String,
        attempt: u32,
        kind: TimeoutKind,
    },
    #[error("activity {activity_type} was cancelled")]
    Cancelled {
        activity_id: String,
        activity_type: String,
    },
}

/// How a workflow body ended without a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowError {
    #[error(transparent)]
    Activity(#[from] ActivityFailure),
    #[error("workflow was cancelled")]
    Cancelled,
    #[error("cannot decode payload: {message}")]
    Decode { message: String },
}

impl WorkflowError {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Activity(ActivityFailure::Cancelled { .. })
        )
    }

    /// Whether an activity ran past its schedule-to-close deadline. A
    /// start-to-close timeout that exhausts retries is an ordinary failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Activity(ActivityFailure::TimedOut {
                kind: TimeoutKind::ScheduleToClose,
                ..
            })
        )
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum HistoryEvent {
    WorkflowExecutionStarted {
        workflow_type: String,
        input: Value,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    ActivityTaskCompleted {
        activity_id: String,
        attempt: u32,
        result: Value,
    },
    ActivityTaskFailed {
        activity_id: String,
        attempt: u32,
        failure: Failure,
    },
    ActivityTaskTimedOut {
        activity_id: String,
        attempt: u32,
        kind: TimeoutKind,
    },
    ActivityTaskCancelled {
        activity_id: String,
    },
    WorkflowCancelRequested,
    WorkflowExecutionCompleted {
        result: Value,
    },
    WorkflowExecutionFailed {
        error: WorkflowError,
    },
    WorkflowExecutionTimedOut {
        error: WorkflowError,
    },
    WorkflowExecutionCancelled,
}

impl HistoryEvent {
    /// The activity this event belongs to, if any.
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityTaskScheduled { activity_id, .. }
            | Self::ActivityTaskCompleted { activity_id, .. }
            | Self::ActivityTaskFailed { activity_id, .. }
            | Self::ActivityTaskTimedOut { activity_id, .. }
            | Self::ActivityTaskCancelled { activity_id } => Some(activity_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A decision made by one workflow task, applied atomically by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type")]
pub enum Command {
    ScheduleActivity {
        activity_id: String,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    RequestCancelActivity {
        activity_id: String,
    },
    CompleteWorkflow {
        result: Value,
    },
    FailWorkflow {
        error: WorkflowError,
    },
    CancelWorkflow,
}

impl Command {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::CancelWorkflow
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged_by_type() {
        let event = HistoryEvent::ActivityTaskCompleted {
            activity_id: "1".into(),
            attempt: 2,
            result: json!([[1, 2]]),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "ActivityTaskCompleted");
        assert_eq!(value["attempt"], 2);
        assert_eq!(serde_json::from_value::<HistoryEvent>(value).unwrap(), event);

        let unit = serde_json::to_value(HistoryEvent::WorkflowCancelRequested).unwrap();
        assert_eq!(unit, json!({ "event_type": "WorkflowCancelRequested" }));
    }

    #[test]
    fn workflow_error_classification() {
        let timed_out = WorkflowError::from(ActivityFailure::TimedOut {
            activity_id: "1".into(),
            activity_type: "cluster_dive_frames".into(),
            attempt: 1,
            kind: TimeoutKind::ScheduleToClose,
        });
        assert!(timed_out.is_timeout());
        assert!(!timed_out.is_cancellation());

        let attempt_timed_out = WorkflowError::from(ActivityFailure::TimedOut {
            activity_id: "1".into(),
            activity_type: "cluster_dive_frames".into(),
            attempt: 5,
            kind: TimeoutKind::StartToClose,
        });
        assert!(!attempt_timed_out.is_timeout());

        let cancelled = WorkflowError::from(ActivityFailure::Cancelled {
            activity_id: "1".into(),
            activity_type: "cluster_dive_frames".into(),
        });
        assert!(cancelled.is_cancellation());
        assert!(WorkflowError::Cancelled.is_cancellation());
    }

    #[test]
    fn activity_failure_message_names_the_cause() {
        let failure = ActivityFailure::Failed {
            activity_id: "1".into(),
            activity_type: "cluster_dive_frames".into(),
            attempt: 3,
            failure: Failure {
                message: "bad input".into(),
                error_type: "DecodeError".into(),
                non_retryable: true,
            },
        };
        assert_eq!(
            failure.to_string(),
            "activity cluster_dive_frames failed on attempt 3: DecodeError: bad input"
        );
    }

    #[test]
    fn terminal_commands() {
        assert!(Command::CancelWorkflow.is_terminal());
        assert!(!Command::RequestCancelActivity { activity_id: "1".into() }.is_terminal());
    }
}
