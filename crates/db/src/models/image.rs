use fishsense_core::image::ImageRef;
use fishsense_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `images` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Image {
    pub id: DbId,
    pub path: String,
    pub taken_datetime: Option<Timestamp>,
    /// Hex MD5 of the raw file.
    pub checksum: String,
    pub is_canonical: bool,
    pub dive_id: Option<DbId>,
    pub camera_id: Option<DbId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<&Image> for ImageRef {
    fn from(image: &Image) -> Self {
        ImageRef {
            id: image.id,
            path: image.path.clone(),
            taken_at: image.taken_datetime,
            checksum: image.checksum.clone(),
            dive_id: image.dive_id,
        }
    }
}

/// Upsert keyed on `path`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertImage {
    pub path: String,
    pub taken_datetime: Option<Timestamp>,
    pub checksum: String,
    #[serde(default)]
    pub is_canonical: bool,
    pub dive_id: Option<DbId>,
    pub camera_id: Option<DbId>,
}
