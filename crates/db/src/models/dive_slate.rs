use fishsense_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `dive_slates` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DiveSlate {
    pub id: DbId,
    pub name: String,
    pub path: String,
    pub created_at: Timestamp,
}

/// Upsert keyed on `name`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertDiveSlate {
    pub name: String,
    pub path: String,
}
