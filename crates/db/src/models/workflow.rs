//! Task-queue rows: workflow executions, history events and activity
//! invocations. Payload columns are opaque JSON at this layer.

use fishsense_core::types::{DbId, Timestamp};
use fishsense_core::workflow::{ActivityStatus, StatusId, WorkflowStatus};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `workflow_executions` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowExecution {
    pub id: DbId,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub status_id: StatusId,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub failure: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub task_pending: bool,
    pub lease_id: Option<Uuid>,
    pub locked_until: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub closed_at: Option<Timestamp>,
}

impl WorkflowExecution {
    pub fn status(&self) -> Option<WorkflowStatus> {
        WorkflowStatus::from_id(self.status_id)
    }
}

/// DTO for enqueuing a new workflow execution.
#[derive(Debug, Clone)]
pub struct NewWorkflowExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
}

/// A row from the `workflow_history` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HistoryRecord {
    pub execution_id: DbId,
    pub event_id: i64,
    pub event: serde_json::Value,
    pub recorded_at: Timestamp,
}

/// A row from the `activity_invocations` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ActivityInvocation {
    pub id: DbId,
    pub execution_id: DbId,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub status_id: StatusId,
    pub input: serde_json::Value,
    pub options: serde_json::Value,
    pub attempt: i32,
    pub available_at: Timestamp,
    pub scheduled_at: Timestamp,
    pub schedule_to_close_deadline: Timestamp,
    /// Per-attempt deadline, in milliseconds from start.
    pub start_to_close_ms: Option<i64>,
    pub started_at: Option<Timestamp>,
    pub start_to_close_deadline: Option<Timestamp>,
    pub last_failure: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub closed_at: Option<Timestamp>,
}

impl ActivityInvocation {
    pub fn status(&self) -> Option<ActivityStatus> {
        ActivityStatus::from_id(self.status_id)
    }
}

/// DTO for scheduling an activity's first attempt.
#[derive(Debug, Clone)]
pub struct NewActivityInvocation {
    pub execution_id: DbId,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: serde_json::Value,
    pub scheduled_at: Timestamp,
    pub schedule_to_close_deadline: Timestamp,
    pub start_to_close_ms: Option<i64>,
}
