use fishsense_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `dive_frame_clusters` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DiveFrameCluster {
    pub id: DbId,
    pub dive_id: DbId,
    /// Run of the clustering workflow that produced this cluster.
    pub workflow_run_id: Option<Uuid>,
    pub created_at: Timestamp,
}

/// A row from the `dive_frame_cluster_image_mappings` join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow, Serialize)]
pub struct DiveFrameClusterImageMapping {
    pub dive_frame_cluster_id: DbId,
    pub image_id: DbId,
}
