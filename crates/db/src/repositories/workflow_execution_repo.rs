//! Repository for the `workflow_executions` table.
//!
//! A workflow task is claimed by leasing the execution row: `lease_id`
//! identifies the holder and `locked_until` bounds how long it may hold
//! it. `task_pending` stays set until the holder reports back, so a lease
//! that lapses makes the task claimable again.

use fishsense_core::types::{DbId, Timestamp};
use fishsense_core::workflow::WorkflowStatus;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::workflow::{NewWorkflowExecution, WorkflowExecution};

/// Column list for `workflow_executions` queries.
const COLUMNS: &str = "\
    id, workflow_id, run_id, workflow_type, task_queue, status_id, \
    input, result, failure, cancel_requested, task_pending, lease_id, locked_until, \
    created_at, updated_at, closed_at";

/// Provides data access for workflow executions.
pub struct WorkflowExecutionRepo;

impl WorkflowExecutionRepo {
    /// Enqueue a new execution with a pending first workflow task.
    ///
    /// Fails with a unique violation if another run of the same
    /// `workflow_id` is still open.
    pub async fn insert<'e>(
        executor: impl PgExecutor<'e>,
        input: &NewWorkflowExecution,
    ) -> Result<WorkflowExecution, sqlx::Error> {
        let query = format!(
            "INSERT INTO workflow_executions \
                (workflow_id, run_id, workflow_type, task_queue, status_id, input) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, WorkflowExecution>(&query)
            .bind(&input.workflow_id)
            .bind(input.run_id)
            .bind(&input.workflow_type)
            .bind(&input.task_queue)
            .bind(WorkflowStatus::Scheduled.id())
            .bind(&input.input)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<WorkflowExecution>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflow_executions WHERE id = $1");
        sqlx::query_as::<_, WorkflowExecution>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_run_id<'e>(
        executor: impl PgExecutor<'e>,
        run_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflow_executions WHERE run_id = $1");
        sqlx::query_as::<_, WorkflowExecution>(&query)
            .bind(run_id)
            .fetch_optional(executor)
            .await
    }

    /// Row-lock an execution for the rest of the caller's transaction.
    pub async fn lock_by_run_id<'e>(
        executor: impl PgExecutor<'e>,
        run_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM workflow_executions WHERE run_id = $1 FOR UPDATE");
        sqlx::query_as::<_, WorkflowExecution>(&query)
            .bind(run_id)
            .fetch_optional(executor)
            .await
    }

    /// Row-lock an execution by primary key.
    pub async fn lock_by_id<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<WorkflowExecution>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflow_executions WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, WorkflowExecution>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Atomically lease the oldest execution with a due workflow task.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent pollers never
    /// receive the same execution. The first claim moves the execution from
    /// `Scheduled` to `Running`.
    pub async fn claim_next_task<'e>(
        executor: impl PgExecutor<'e>,
        task_queue: &str,
        now: Timestamp,
        lease_id: Uuid,
        locked_until: Timestamp,
    ) -> Result<Option<WorkflowExecution>, sqlx::Error> {
        let query = format!(
            "UPDATE workflow_executions \
             SET lease_id = $3, locked_until = $4, updated_at = $2, \
                 status_id = CASE WHEN status_id = $5 THEN $6 ELSE status_id END \
             WHERE id = ( \
                 SELECT id FROM workflow_executions \
                 WHERE task_queue = $1 AND task_pending \
                   AND status_id IN ($5, $6) \
                   AND (locked_until IS NULL OR locked_until <= $2) \
                 ORDER BY created_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, WorkflowExecution>(&query)
            .bind(task_queue)
            .bind(now)
            .bind(lease_id)
            .bind(locked_until)
            .bind(WorkflowStatus::Scheduled.id())
            .bind(WorkflowStatus::Running.id())
            .fetch_optional(executor)
            .await
    }

    /// Drop the lease. `task_pending` says whether another workflow task is
    /// due; `locked_until` may hold back the next claim.
    pub async fn release_task<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        task_pending: bool,
        locked_until: Option<Timestamp>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workflow_executions \
             SET lease_id = NULL, locked_until = $3, task_pending = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(task_pending)
        .bind(locked_until)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Flag that new history needs a workflow task.
    pub async fn mark_task_pending<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workflow_executions SET task_pending = TRUE, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Record a cancellation request. Returns `false` if the execution is
    /// closed or was already asked to cancel.
    pub async fn request_cancel<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflow_executions \
             SET cancel_requested = TRUE, task_pending = TRUE, updated_at = NOW() \
             WHERE id = $1 AND NOT cancel_requested AND status_id IN ($2, $3)",
        )
        .bind(id)
        .bind(WorkflowStatus::Scheduled.id())
        .bind(WorkflowStatus::Running.id())
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move an open execution to a terminal status.
    ///
    /// Returns `true` if the execution was closed, `false` if it already
    /// was.
    pub async fn close<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        status: WorkflowStatus,
        result: Option<&serde_json::Value>,
        failure: Option<&serde_json::Value>,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflow_executions \
             SET status_id = $2, result = $3, failure = $4, closed_at = $5, updated_at = $5, \
                 task_pending = FALSE, lease_id = NULL, locked_until = NULL \
             WHERE id = $1 AND status_id IN ($6, $7)",
        )
        .bind(id)
        .bind(status.id())
        .bind(result)
        .bind(failure)
        .bind(now)
        .bind(WorkflowStatus::Scheduled.id())
        .bind(WorkflowStatus::Running.id())
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
