//! Head/tail and laser label rows.

use fishsense_core::label_studio::{LabelShape, ParsedLabel};
use fishsense_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `head_tail_labels` table. Coordinates are pixels.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HeadTailLabel {
    pub id: DbId,
    pub label_studio_task_id: i64,
    pub head_x: Option<i32>,
    pub head_y: Option<i32>,
    pub tail_x: Option<i32>,
    pub tail_y: Option<i32>,
    pub updated_at: Option<Timestamp>,
    pub completed: bool,
    pub label_studio_json: Option<serde_json::Value>,
    pub image_id: Option<DbId>,
    pub user_id: Option<DbId>,
    pub created_at: Timestamp,
}

/// A row from the `laser_labels` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LaserLabel {
    pub id: DbId,
    pub label_studio_task_id: i64,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub label: Option<String>,
    pub updated_at: Option<Timestamp>,
    pub completed: bool,
    pub label_studio_json: Option<serde_json::Value>,
    pub image_id: Option<DbId>,
    pub user_id: Option<DbId>,
    pub created_at: Timestamp,
}

/// Upsert keyed on `label_studio_task_id`, shared by both label tables.
#[derive(Debug, Clone)]
pub struct UpsertLabel {
    pub label: ParsedLabel,
    pub image_id: Option<DbId>,
    pub user_id: Option<DbId>,
}

impl UpsertLabel {
    /// Head and tail pixels, when the task carries a keypoint pair.
    pub(crate) fn head_tail(&self) -> [Option<i32>; 4] {
        match &self.label.shape {
            Some(LabelShape::KeypointPair { head, tail }) => {
                [Some(head.x), Some(head.y), Some(tail.x), Some(tail.y)]
            }
            _ => [None; 4],
        }
    }

    /// Laser pixel and label, when the task carries a single keypoint.
    pub(crate) fn laser(&self) -> (Option<i32>, Option<i32>, Option<&str>) {
        match &self.label.shape {
            Some(LabelShape::SingleKeypoint { point, label }) => {
                (Some(point.x), Some(point.y), Some(label.as_str()))
            }
            _ => (None, None, None),
        }
    }
}
