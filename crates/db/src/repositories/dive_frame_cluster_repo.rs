//! Repository for `dive_frame_clusters` and their image mappings.

use fishsense_core::types::DbId;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::dive_frame_cluster::{DiveFrameCluster, DiveFrameClusterImageMapping};
use crate::models::image::Image;

/// Column list for `dive_frame_clusters` queries.
const COLUMNS: &str = "id, dive_id, workflow_run_id, created_at";

/// Provides data access for persisted frame clusters.
pub struct DiveFrameClusterRepo;

impl DiveFrameClusterRepo {
    /// Replace every cluster of a dive with `clusters` (lists of image ids).
    pub async fn replace_for_dive(
        pool: &PgPool,
        dive_id: DbId,
        workflow_run_id: Option<Uuid>,
        clusters: &[Vec<DbId>],
    ) -> Result<Vec<DiveFrameCluster>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let created =
            Self::replace_for_dive_in_tx(&mut tx, dive_id, workflow_run_id, clusters).await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Replace a dive's clusters within an existing transaction. Empty
    /// clusters are skipped.
    pub async fn replace_for_dive_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        dive_id: DbId,
        workflow_run_id: Option<Uuid>,
        clusters: &[Vec<DbId>],
    ) -> Result<Vec<DiveFrameCluster>, sqlx::Error> {
        sqlx::query("DELETE FROM dive_frame_clusters WHERE dive_id = $1")
            .bind(dive_id)
            .execute(&mut **tx)
            .await?;

        let insert_cluster = format!(
            "INSERT INTO dive_frame_clusters (dive_id, workflow_run_id) \
             VALUES ($1, $2) RETURNING {COLUMNS}"
        );
        let mut created = Vec::with_capacity(clusters.len());
        for image_ids in clusters.iter().filter(|c| !c.is_empty()) {
            let cluster = sqlx::query_as::<_, DiveFrameCluster>(&insert_cluster)
                .bind(dive_id)
                .bind(workflow_run_id)
                .fetch_one(&mut **tx)
                .await?;

            sqlx::query(
                "INSERT INTO dive_frame_cluster_image_mappings (dive_frame_cluster_id, image_id) \
                 SELECT $1, UNNEST($2::BIGINT[])",
            )
            .bind(cluster.id)
            .bind(image_ids.as_slice())
            .execute(&mut **tx)
            .await?;

            created.push(cluster);
        }

        tracing::debug!(dive_id, clusters = created.len(), "Replaced dive frame clusters");
        Ok(created)
    }

    pub async fn list<'e>(executor: impl PgExecutor<'e>) -> Result<Vec<DiveFrameCluster>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dive_frame_clusters ORDER BY id");
        sqlx::query_as::<_, DiveFrameCluster>(&query)
            .fetch_all(executor)
            .await
    }

    pub async fn list_by_dive<'e>(
        executor: impl PgExecutor<'e>,
        dive_id: DbId,
    ) -> Result<Vec<DiveFrameCluster>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM dive_frame_clusters WHERE dive_id = $1 ORDER BY id");
        sqlx::query_as::<_, DiveFrameCluster>(&query)
            .bind(dive_id)
            .fetch_all(executor)
            .await
    }

    pub async fn list_mappings<'e>(
        executor: impl PgExecutor<'e>,
        cluster_id: DbId,
    ) -> Result<Vec<DiveFrameClusterImageMapping>, sqlx::Error> {
        sqlx::query_as::<_, DiveFrameClusterImageMapping>(
            "SELECT dive_frame_cluster_id, image_id \
             FROM dive_frame_cluster_image_mappings \
             WHERE dive_frame_cluster_id = $1 ORDER BY image_id",
        )
        .bind(cluster_id)
        .fetch_all(executor)
        .await
    }

    /// Images of one cluster, ordered by path.
    pub async fn list_images<'e>(
        executor: impl PgExecutor<'e>,
        cluster_id: DbId,
    ) -> Result<Vec<Image>, sqlx::Error> {
        sqlx::query_as::<_, Image>(
            "SELECT i.id, i.path, i.taken_datetime, i.checksum, i.is_canonical, \
                    i.dive_id, i.camera_id, i.created_at, i.updated_at \
             FROM images i \
             JOIN dive_frame_cluster_image_mappings m ON m.image_id = i.id \
             WHERE m.dive_frame_cluster_id = $1 \
             ORDER BY i.path",
        )
        .bind(cluster_id)
        .fetch_all(executor)
        .await
    }
}
