//! Repository for the `images` table.

use fishsense_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::image::{Image, UpsertImage};

/// Column list for `images` queries.
const COLUMNS: &str = "\
    id, path, taken_datetime, checksum, is_canonical, dive_id, camera_id, \
    created_at, updated_at";

/// Provides data access for images.
pub struct ImageRepo;

impl ImageRepo {
    /// Insert an image, or refresh the metadata of the image at `path`.
    pub async fn upsert<'e>(
        executor: impl PgExecutor<'e>,
        input: &UpsertImage,
    ) -> Result<Image, sqlx::Error> {
        let query = format!(
            "INSERT INTO images (path, taken_datetime, checksum, is_canonical, dive_id, camera_id) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (path) DO UPDATE SET \
                taken_datetime = EXCLUDED.taken_datetime, \
                checksum = EXCLUDED.checksum, \
                is_canonical = EXCLUDED.is_canonical, \
                dive_id = EXCLUDED.dive_id, \
                camera_id = EXCLUDED.camera_id, \
                updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Image>(&query)
            .bind(&input.path)
            .bind(input.taken_datetime)
            .bind(&input.checksum)
            .bind(input.is_canonical)
            .bind(input.dive_id)
            .bind(input.camera_id)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Image>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM images WHERE id = $1");
        sqlx::query_as::<_, Image>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_path<'e>(
        executor: impl PgExecutor<'e>,
        path: &str,
    ) -> Result<Option<Image>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM images WHERE path = $1");
        sqlx::query_as::<_, Image>(&query)
            .bind(path)
            .fetch_optional(executor)
            .await
    }

    /// The canonical image with this checksum, if any.
    pub async fn find_canonical_by_checksum<'e>(
        executor: impl PgExecutor<'e>,
        checksum: &str,
    ) -> Result<Option<Image>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM images WHERE checksum = $1 AND is_canonical LIMIT 1"
        );
        sqlx::query_as::<_, Image>(&query)
            .bind(checksum)
            .fetch_optional(executor)
            .await
    }

    /// Canonical images whose checksum is in `checksums`.
    pub async fn list_canonical_by_checksums<'e>(
        executor: impl PgExecutor<'e>,
        checksums: &[String],
    ) -> Result<Vec<Image>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM images WHERE checksum = ANY($1) AND is_canonical ORDER BY id"
        );
        sqlx::query_as::<_, Image>(&query)
            .bind(checksums)
            .fetch_all(executor)
            .await
    }

    /// Images of one dive, ordered by path.
    pub async fn list_by_dive<'e>(
        executor: impl PgExecutor<'e>,
        dive_id: DbId,
    ) -> Result<Vec<Image>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM images WHERE dive_id = $1 ORDER BY path");
        sqlx::query_as::<_, Image>(&query)
            .bind(dive_id)
            .fetch_all(executor)
            .await
    }

    pub async fn list_by_dives<'e>(
        executor: impl PgExecutor<'e>,
        dive_ids: &[DbId],
    ) -> Result<Vec<Image>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM images WHERE dive_id = ANY($1) ORDER BY dive_id, path"
        );
        sqlx::query_as::<_, Image>(&query)
            .bind(dive_ids)
            .fetch_all(executor)
            .await
    }

    pub async fn list_by_ids<'e>(
        executor: impl PgExecutor<'e>,
        ids: &[DbId],
    ) -> Result<Vec<Image>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM images WHERE id = ANY($1) ORDER BY id");
        sqlx::query_as::<_, Image>(&query)
            .bind(ids)
            .fetch_all(executor)
            .await
    }
}
