//! Repository for the `cameras` table.

use fishsense_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::camera::{Camera, UpsertCamera};

/// Column list for `cameras` queries.
const COLUMNS: &str = "id, serial_number, name, created_at, updated_at";

/// Provides data access for cameras.
pub struct CameraRepo;

impl CameraRepo {
    /// Insert a camera, or rename the existing one with the same serial number.
    pub async fn upsert<'e>(
        executor: impl PgExecutor<'e>,
        input: &UpsertCamera,
    ) -> Result<Camera, sqlx::Error> {
        let query = format!(
            "INSERT INTO cameras (serial_number, name) \
             VALUES ($1, $2) \
             ON CONFLICT (serial_number) \
             DO UPDATE SET name = EXCLUDED.name, updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Camera>(&query)
            .bind(&input.serial_number)
            .bind(&input.name)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Camera>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM cameras WHERE id = $1");
        sqlx::query_as::<_, Camera>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_serial_number<'e>(
        executor: impl PgExecutor<'e>,
        serial_number: &str,
    ) -> Result<Option<Camera>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM cameras WHERE serial_number = $1");
        sqlx::query_as::<_, Camera>(&query)
            .bind(serial_number)
            .fetch_optional(executor)
            .await
    }
}
