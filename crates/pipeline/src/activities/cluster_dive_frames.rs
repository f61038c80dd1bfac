//! Groups a dive's frames into temporal clusters.

use std::time::Instant;

use async_trait::async_trait;
use fishsense_core::clustering::group_dive_frames;
use fishsense_core::image::ImageRef;
use serde_json::Value;

use crate::activity::{Activity, ActivityContext, ActivityError, PANIC_ERROR};

/// Activity type name.
pub const CLUSTER_DIVE_FRAMES: &str = "cluster_dive_frames";

/// Runs HDBSCAN over image capture times on the blocking pool.
///
/// Input: a JSON array of images. Output: a JSON array of clusters, each
/// an array of images in input order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterDiveFramesActivity;

#[async_trait]
impl Activity for ClusterDiveFramesActivity {
    fn name(&self) -> &'static str {
        CLUSTER_DIVE_FRAMES
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let images: Vec<ImageRef> = serde_json::from_value(input).map_err(ActivityError::decode)?;
        let image_count = images.len();
        let started = Instant::now();

        let clusters = tokio::task::spawn_blocking(move || group_dive_frames(&images))
            .await
            .map_err(|e| ActivityError::retryable(PANIC_ERROR, e.to_string()))?;

        tracing::info!(
            run_id = %ctx.workflow.run_id,
            attempt = ctx.attempt,
            images = image_count,
            clusters = clusters.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Clustered dive frames"
        );
        serde_json::to_value(&clusters).map_err(ActivityError::decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::DECODE_ERROR;
    use crate::broker::WorkflowHandle;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ActivityContext {
        ActivityContext {
            workflow: WorkflowHandle {
                workflow_id: "dive-frame-clustering-1".into(),
                run_id: Uuid::new_v4(),
            },
            activity_id: "1".into(),
            attempt: 1,
        }
    }

    fn image(id: i64, second: u32) -> ImageRef {
        ImageRef {
            id,
            path: format!("P{id:03}.ORF"),
            taken_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, second).unwrap()),
            checksum: format!("{id:032}"),
            dive_id: Some(1),
        }
    }

    #[tokio::test]
    async fn clusters_images_by_capture_time() {
        let images = vec![image(1, 0), image(2, 1), image(3, 2), image(4, 40), image(5, 41)];
        let out = ClusterDiveFramesActivity
            .execute(ctx(), serde_json::to_value(&images).unwrap())
            .await
            .unwrap();

        let clusters: Vec<Vec<ImageRef>> = serde_json::from_value(out).unwrap();
        let ids: Vec<Vec<i64>> = clusters
            .iter()
            .map(|c| c.iter().map(|i| i.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[tokio::test]
    async fn empty_input_yields_no_clusters() {
        let out = ClusterDiveFramesActivity.execute(ctx(), json!([])).await.unwrap();
        assert_eq!(out, json!([]));
    }

    #[tokio::test]
    async fn malformed_input_fails_the_attempt() {
        let err = ClusterDiveFramesActivity
            .execute(ctx(), json!({ "images": "nope" }))
            .await
            .unwrap_err();
        assert_eq!(err.error_type, DECODE_ERROR);
        assert!(!err.non_retryable);
    }
}
