//! Repository for the `dive_slates` table.

use fishsense_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::dive_slate::{DiveSlate, UpsertDiveSlate};

/// Column list for `dive_slates` queries.
const COLUMNS: &str = "id, name, path, created_at";

/// Provides data access for dive slates.
pub struct DiveSlateRepo;

impl DiveSlateRepo {
    /// Insert a slate, or move the existing slate of the same name.
    pub async fn upsert<'e>(
        executor: impl PgExecutor<'e>,
        input: &UpsertDiveSlate,
    ) -> Result<DiveSlate, sqlx::Error> {
        let query = format!(
            "INSERT INTO dive_slates (name, path) \
             VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET path = EXCLUDED.path \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DiveSlate>(&query)
            .bind(&input.name)
            .bind(&input.path)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<DiveSlate>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dive_slates WHERE id = $1");
        sqlx::query_as::<_, DiveSlate>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_name<'e>(
        executor: impl PgExecutor<'e>,
        name: &str,
    ) -> Result<Option<DiveSlate>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dive_slates WHERE name = $1");
        sqlx::query_as::<_, DiveSlate>(&query)
            .bind(name)
            .fetch_optional(executor)
            .await
    }
}
