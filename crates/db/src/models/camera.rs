use fishsense_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `cameras` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Camera {
    pub id: DbId,
    pub serial_number: String,
    pub name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Upsert keyed on `serial_number`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertCamera {
    pub serial_number: String,
    pub name: String,
}
