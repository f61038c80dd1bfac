//! Repository for the `activity_invocations` table.
//!
//! Status changes are guarded in SQL: each update names the statuses it
//! may leave from, so a write racing a timeout or cancellation affects no
//! rows instead of reopening a closed invocation.

use fishsense_core::types::{DbId, Timestamp};
use fishsense_core::workflow::ActivityStatus;
use sqlx::PgExecutor;

use crate::models::workflow::{ActivityInvocation, NewActivityInvocation};

/// Column list for `activity_invocations` queries.
const COLUMNS: &str = "\
    id, execution_id, activity_id, activity_type, task_queue, status_id, \
    input, options, attempt, available_at, scheduled_at, schedule_to_close_deadline, \
    start_to_close_ms, started_at, start_to_close_deadline, last_failure, result, closed_at";

/// Provides data access for activity invocations.
pub struct ActivityInvocationRepo;

impl ActivityInvocationRepo {
    /// Schedule the first attempt of an activity, due immediately.
    pub async fn insert<'e>(
        executor: impl PgExecutor<'e>,
        input: &NewActivityInvocation,
    ) -> Result<ActivityInvocation, sqlx::Error> {
        let query = format!(
            "INSERT INTO activity_invocations \
                (execution_id, activity_id, activity_type, task_queue, status_id, input, options, \
                 available_at, scheduled_at, schedule_to_close_deadline, start_to_close_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, $10) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ActivityInvocation>(&query)
            .bind(input.execution_id)
            .bind(&input.activity_id)
            .bind(&input.activity_type)
            .bind(&input.task_queue)
            .bind(ActivityStatus::Scheduled.id())
            .bind(&input.input)
            .bind(&input.options)
            .bind(input.scheduled_at)
            .bind(input.schedule_to_close_deadline)
            .bind(input.start_to_close_ms)
            .fetch_one(executor)
            .await
    }

    /// Row-lock one invocation of an execution.
    pub async fn lock<'e>(
        executor: impl PgExecutor<'e>,
        execution_id: DbId,
        activity_id: &str,
    ) -> Result<Option<ActivityInvocation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM activity_invocations \
             WHERE execution_id = $1 AND activity_id = $2 FOR UPDATE"
        );
        sqlx::query_as::<_, ActivityInvocation>(&query)
            .bind(execution_id)
            .bind(activity_id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list_by_execution<'e>(
        executor: impl PgExecutor<'e>,
        execution_id: DbId,
    ) -> Result<Vec<ActivityInvocation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM activity_invocations WHERE execution_id = $1 ORDER BY id"
        );
        sqlx::query_as::<_, ActivityInvocation>(&query)
            .bind(execution_id)
            .fetch_all(executor)
            .await
    }

    /// Atomically start the oldest due invocation on a task queue.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` to prevent double delivery.
    pub async fn claim_next<'e>(
        executor: impl PgExecutor<'e>,
        task_queue: &str,
        now: Timestamp,
    ) -> Result<Option<ActivityInvocation>, sqlx::Error> {
        let query = format!(
            "UPDATE activity_invocations \
             SET status_id = $3, started_at = $2, \
                 start_to_close_deadline = \
                     $2 + start_to_close_ms * INTERVAL '1 millisecond' \
             WHERE id = ( \
                 SELECT id FROM activity_invocations \
                 WHERE task_queue = $1 AND status_id = $4 AND available_at <= $2 \
                 ORDER BY available_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ActivityInvocation>(&query)
            .bind(task_queue)
            .bind(now)
            .bind(ActivityStatus::Started.id())
            .bind(ActivityStatus::Scheduled.id())
            .fetch_optional(executor)
            .await
    }

    /// Record the result of the running attempt `attempt`.
    ///
    /// Returns `false` when that attempt is no longer the running one.
    pub async fn complete<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        attempt: i32,
        result: &serde_json::Value,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE activity_invocations \
             SET status_id = $4, result = $3, closed_at = $5 \
             WHERE id = $1 AND attempt = $2 AND status_id = $6",
        )
        .bind(id)
        .bind(attempt)
        .bind(result)
        .bind(ActivityStatus::Completed.id())
        .bind(now)
        .bind(ActivityStatus::Started.id())
        .execute(executor)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Put the running attempt back in the queue as attempt `attempt + 1`,
    /// due at `available_at`.
    pub async fn retry<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        attempt: i32,
        available_at: Timestamp,
        failure: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE activity_invocations \
             SET status_id = $5, attempt = attempt + 1, available_at = $3, last_failure = $4, \
                 started_at = NULL, start_to_close_deadline = NULL \
             WHERE id = $1 AND attempt = $2 AND status_id = $6",
        )
        .bind(id)
        .bind(attempt)
        .bind(available_at)
        .bind(failure)
        .bind(ActivityStatus::Scheduled.id())
        .bind(ActivityStatus::Started.id())
        .execute(executor)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Move an open invocation to a terminal status.
    pub async fn close<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        status: ActivityStatus,
        failure: Option<&serde_json::Value>,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE activity_invocations \
             SET status_id = $2, last_failure = COALESCE($3, last_failure), closed_at = $4 \
             WHERE id = $1 AND status_id IN ($5, $6)",
        )
        .bind(id)
        .bind(status.id())
        .bind(failure)
        .bind(now)
        .bind(ActivityStatus::Scheduled.id())
        .bind(ActivityStatus::Started.id())
        .execute(executor)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Open invocations whose schedule-to-close deadline has passed.
    pub async fn list_schedule_to_close_expired<'e>(
        executor: impl PgExecutor<'e>,
        now: Timestamp,
    ) -> Result<Vec<ActivityInvocation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM activity_invocations \
             WHERE status_id IN ($2, $3) AND schedule_to_close_deadline <= $1 \
             ORDER BY schedule_to_close_deadline, id"
        );
        sqlx::query_as::<_, ActivityInvocation>(&query)
            .bind(now)
            .bind(ActivityStatus::Scheduled.id())
            .bind(ActivityStatus::Started.id())
            .fetch_all(executor)
            .await
    }

    /// Running attempts whose start-to-close deadline has passed.
    pub async fn list_start_to_close_expired<'e>(
        executor: impl PgExecutor<'e>,
        now: Timestamp,
    ) -> Result<Vec<ActivityInvocation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM activity_invocations \
             WHERE status_id = $2 AND start_to_close_deadline <= $1 \
             ORDER BY start_to_close_deadline, id"
        );
        sqlx::query_as::<_, ActivityInvocation>(&query)
            .bind(now)
            .bind(ActivityStatus::Started.id())
            .fetch_all(executor)
            .await
    }
}
