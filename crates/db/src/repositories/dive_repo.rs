//! Repository for the `dives` table.

use fishsense_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::dive::{Dive, UpsertDive};

/// Column list for `dives` queries.
const COLUMNS: &str = "\
    id, name, path, dive_datetime, priority, flip_dive_slate, \
    camera_id, dive_slate_id, created_at, updated_at";

/// Provides data access for dives.
pub struct DiveRepo;

impl DiveRepo {
    /// Insert a dive, or overwrite the mutable fields of the dive at `path`.
    pub async fn upsert<'e>(
        executor: impl PgExecutor<'e>,
        input: &UpsertDive,
    ) -> Result<Dive, sqlx::Error> {
        let query = format!(
            "INSERT INTO dives \
                (name, path, dive_datetime, priority, flip_dive_slate, camera_id, dive_slate_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (path) DO UPDATE SET \
                name = EXCLUDED.name, \
                dive_datetime = EXCLUDED.dive_datetime, \
                priority = EXCLUDED.priority, \
                flip_dive_slate = EXCLUDED.flip_dive_slate, \
                camera_id = EXCLUDED.camera_id, \
                dive_slate_id = EXCLUDED.dive_slate_id, \
                updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Dive>(&query)
            .bind(&input.name)
            .bind(&input.path)
            .bind(input.dive_datetime)
            .bind(input.priority.as_str())
            .bind(input.flip_dive_slate)
            .bind(input.camera_id)
            .bind(input.dive_slate_id)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Dive>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dives WHERE id = $1");
        sqlx::query_as::<_, Dive>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_path<'e>(
        executor: impl PgExecutor<'e>,
        path: &str,
    ) -> Result<Option<Dive>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dives WHERE path = $1");
        sqlx::query_as::<_, Dive>(&query)
            .bind(path)
            .fetch_optional(executor)
            .await
    }

    /// All dives, oldest first. Undated dives sort last.
    pub async fn list<'e>(executor: impl PgExecutor<'e>) -> Result<Vec<Dive>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dives ORDER BY dive_datetime, id");
        sqlx::query_as::<_, Dive>(&query).fetch_all(executor).await
    }

    /// Dives with the given ids, oldest first.
    pub async fn list_by_ids<'e>(
        executor: impl PgExecutor<'e>,
        ids: &[DbId],
    ) -> Result<Vec<Dive>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM dives WHERE id = ANY($1) ORDER BY dive_datetime, id"
        );
        sqlx::query_as::<_, Dive>(&query)
            .bind(ids)
            .fetch_all(executor)
            .await
    }

    /// Dives that have no frame clusters yet, high priority first.
    pub async fn list_unclustered<'e>(
        executor: impl PgExecutor<'e>,
    ) -> Result<Vec<Dive>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM dives d \
             WHERE NOT EXISTS (SELECT 1 FROM dive_frame_clusters c WHERE c.dive_id = d.id) \
             ORDER BY (priority = 'HIGH') DESC, dive_datetime, id"
        );
        sqlx::query_as::<_, Dive>(&query).fetch_all(executor).await
    }
}
