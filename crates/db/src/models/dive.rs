use fishsense_core::image::{DiveRef, Priority};
use fishsense_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `dives` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Dive {
    pub id: DbId,
    pub name: Option<String>,
    pub path: String,
    pub dive_datetime: Option<Timestamp>,
    /// `LOW` or `HIGH`.
    pub priority: String,
    pub flip_dive_slate: bool,
    pub camera_id: Option<DbId>,
    pub dive_slate_id: Option<DbId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Dive {
    pub fn priority(&self) -> Priority {
        Priority::parse(&self.priority).unwrap_or_default()
    }
}

impl From<&Dive> for DiveRef {
    fn from(dive: &Dive) -> Self {
        DiveRef {
            id: dive.id,
            name: dive.name.clone(),
            path: dive.path.clone(),
            dive_datetime: dive.dive_datetime,
            priority: dive.priority(),
            flip_dive_slate: dive.flip_dive_slate,
            camera_id: dive.camera_id,
            dive_slate_id: dive.dive_slate_id,
        }
    }
}

/// Upsert keyed on `path`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertDive {
    pub name: Option<String>,
    pub path: String,
    pub dive_datetime: Option<Timestamp>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub flip_dive_slate: bool,
    pub camera_id: Option<DbId>,
    pub dive_slate_id: Option<DbId>,
}
