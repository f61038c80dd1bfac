//! Repository for the append-only `workflow_history` table.

use fishsense_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::workflow::HistoryRecord;

/// Provides data access for workflow history events.
pub struct WorkflowHistoryRepo;

impl WorkflowHistoryRepo {
    /// Append an event and return its `event_id` (1-based, gapless).
    ///
    /// The caller must hold the execution's row lock so that concurrent
    /// appends cannot pick the same id.
    pub async fn append<'e>(
        executor: impl PgExecutor<'e>,
        execution_id: DbId,
        event: &serde_json::Value,
    ) -> Result<i64, sqlx::Error> {
        let (event_id,): (i64,) = sqlx::query_as(
            "INSERT INTO workflow_history (execution_id, event_id, event) \
             SELECT $1, COALESCE(MAX(event_id), 0) + 1, $2 \
             FROM workflow_history WHERE execution_id = $1 \
             RETURNING event_id",
        )
        .bind(execution_id)
        .bind(event)
        .fetch_one(executor)
        .await?;
        Ok(event_id)
    }

    /// Id of the newest event, or 0 for an empty history.
    pub async fn last_event_id<'e>(
        executor: impl PgExecutor<'e>,
        execution_id: DbId,
    ) -> Result<i64, sqlx::Error> {
        let (last,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(event_id), 0) FROM workflow_history WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(executor)
        .await?;
        Ok(last)
    }

    /// Full history in event order.
    pub async fn list<'e>(
        executor: impl PgExecutor<'e>,
        execution_id: DbId,
    ) -> Result<Vec<HistoryRecord>, sqlx::Error> {
        sqlx::query_as::<_, HistoryRecord>(
            "SELECT execution_id, event_id, event, recorded_at \
             FROM workflow_history WHERE execution_id = $1 ORDER BY event_id",
        )
        .bind(execution_id)
        .fetch_all(executor)
        .await
    }
}
