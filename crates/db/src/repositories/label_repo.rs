//! Repositories for the `head_tail_labels` and `laser_labels` tables.
//!
//! Both are keyed on the Label Studio task id; re-importing a task
//! overwrites the stored coordinates and raw JSON.

use fishsense_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::label::{HeadTailLabel, LaserLabel, UpsertLabel};

/// Column list for `head_tail_labels` queries.
const HEAD_TAIL_COLUMNS: &str = "\
    id, label_studio_task_id, head_x, head_y, tail_x, tail_y, updated_at, \
    completed, label_studio_json, image_id, user_id, created_at";

/// Column list for `laser_labels` queries.
const LASER_COLUMNS: &str = "\
    id, label_studio_task_id, x, y, label, updated_at, \
    completed, label_studio_json, image_id, user_id, created_at";

/// Provides data access for head/tail labels.
pub struct HeadTailLabelRepo;

impl HeadTailLabelRepo {
    pub async fn upsert<'e>(
        executor: impl PgExecutor<'e>,
        input: &UpsertLabel,
    ) -> Result<HeadTailLabel, sqlx::Error> {
        let [head_x, head_y, tail_x, tail_y] = input.head_tail();
        let query = format!(
            "INSERT INTO head_tail_labels \
                (label_studio_task_id, head_x, head_y, tail_x, tail_y, updated_at, \
                 completed, label_studio_json, image_id, user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (label_studio_task_id) DO UPDATE SET \
                head_x = EXCLUDED.head_x, head_y = EXCLUDED.head_y, \
                tail_x = EXCLUDED.tail_x, tail_y = EXCLUDED.tail_y, \
                updated_at = EXCLUDED.updated_at, \
                completed = EXCLUDED.completed, \
                label_studio_json = EXCLUDED.label_studio_json, \
                image_id = COALESCE(EXCLUDED.image_id, head_tail_labels.image_id), \
                user_id = COALESCE(EXCLUDED.user_id, head_tail_labels.user_id) \
             RETURNING {HEAD_TAIL_COLUMNS}"
        );
        sqlx::query_as::<_, HeadTailLabel>(&query)
            .bind(input.label.task_id)
            .bind(head_x)
            .bind(head_y)
            .bind(tail_x)
            .bind(tail_y)
            .bind(input.label.updated_at)
            .bind(input.label.completed)
            .bind(&input.label.raw)
            .bind(input.image_id)
            .bind(input.user_id)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_task_id<'e>(
        executor: impl PgExecutor<'e>,
        task_id: i64,
    ) -> Result<Option<HeadTailLabel>, sqlx::Error> {
        let query = format!(
            "SELECT {HEAD_TAIL_COLUMNS} FROM head_tail_labels WHERE label_studio_task_id = $1"
        );
        sqlx::query_as::<_, HeadTailLabel>(&query)
            .bind(task_id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list<'e>(executor: impl PgExecutor<'e>) -> Result<Vec<HeadTailLabel>, sqlx::Error> {
        let query = format!("SELECT {HEAD_TAIL_COLUMNS} FROM head_tail_labels ORDER BY id");
        sqlx::query_as::<_, HeadTailLabel>(&query)
            .fetch_all(executor)
            .await
    }

    pub async fn list_by_image_ids<'e>(
        executor: impl PgExecutor<'e>,
        image_ids: &[DbId],
    ) -> Result<Vec<HeadTailLabel>, sqlx::Error> {
        let query = format!(
            "SELECT {HEAD_TAIL_COLUMNS} FROM head_tail_labels \
             WHERE image_id = ANY($1) ORDER BY id"
        );
        sqlx::query_as::<_, HeadTailLabel>(&query)
            .bind(image_ids)
            .fetch_all(executor)
            .await
    }
}

/// Provides data access for laser labels.
pub struct LaserLabelRepo;

impl LaserLabelRepo {
    pub async fn upsert<'e>(
        executor: impl PgExecutor<'e>,
        input: &UpsertLabel,
    ) -> Result<LaserLabel, sqlx::Error> {
        let (x, y, label) = input.laser();
        let query = format!(
            "INSERT INTO laser_labels \
                (label_studio_task_id, x, y, label, updated_at, \
                 completed, label_studio_json, image_id, user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (label_studio_task_id) DO UPDATE SET \
                x = EXCLUDED.x, y = EXCLUDED.y, label = EXCLUDED.label, \
                updated_at = EXCLUDED.updated_at, \
                completed = EXCLUDED.completed, \
                label_studio_json = EXCLUDED.label_studio_json, \
                image_id = COALESCE(EXCLUDED.image_id, laser_labels.image_id), \
                user_id = COALESCE(EXCLUDED.user_id, laser_labels.user_id) \
             RETURNING {LASER_COLUMNS}"
        );
        sqlx::query_as::<_, LaserLabel>(&query)
            .bind(input.label.task_id)
            .bind(x)
            .bind(y)
            .bind(label)
            .bind(input.label.updated_at)
            .bind(input.label.completed)
            .bind(&input.label.raw)
            .bind(input.image_id)
            .bind(input.user_id)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_task_id<'e>(
        executor: impl PgExecutor<'e>,
        task_id: i64,
    ) -> Result<Option<LaserLabel>, sqlx::Error> {
        let query =
            format!("SELECT {LASER_COLUMNS} FROM laser_labels WHERE label_studio_task_id = $1");
        sqlx::query_as::<_, LaserLabel>(&query)
            .bind(task_id)
            .fetch_optional(executor)
            .await
    }

    /// The most recently annotated laser label of an image.
    pub async fn find_by_image_id<'e>(
        executor: impl PgExecutor<'e>,
        image_id: DbId,
    ) -> Result<Option<LaserLabel>, sqlx::Error> {
        let query = format!(
            "SELECT {LASER_COLUMNS} FROM laser_labels WHERE image_id = $1 \
             ORDER BY updated_at DESC NULLS LAST, id DESC LIMIT 1"
        );
        sqlx::query_as::<_, LaserLabel>(&query)
            .bind(image_id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list<'e>(executor: impl PgExecutor<'e>) -> Result<Vec<LaserLabel>, sqlx::Error> {
        let query = format!("SELECT {LASER_COLUMNS} FROM laser_labels ORDER BY id");
        sqlx::query_as::<_, LaserLabel>(&query).fetch_all(executor).await
    }

    pub async fn list_by_image_ids<'e>(
        executor: impl PgExecutor<'e>,
        image_ids: &[DbId],
    ) -> Result<Vec<LaserLabel>, sqlx::Error> {
        let query = format!(
            "SELECT {LASER_COLUMNS} FROM laser_labels WHERE image_id = ANY($1) ORDER BY id"
        );
        sqlx::query_as::<_, LaserLabel>(&query)
            .bind(image_ids)
            .fetch_all(executor)
            .await
    }
}
