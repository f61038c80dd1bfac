//! Repository for the `users` table.

use fishsense_core::label_studio::LabelStudioUser;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};

use crate::models::user::{UpsertUser, User};

/// Column list for `users` queries.
const COLUMNS: &str = "\
    id, label_studio_id, email, first_name, last_name, last_activity, date_joined, \
    created_at, updated_at";

/// Provides data access for annotators.
pub struct UserRepo;

impl UserRepo {
    /// Insert a user, or refresh the profile of the user with this email.
    pub async fn upsert<'e>(
        executor: impl PgExecutor<'e>,
        input: &UpsertUser,
    ) -> Result<User, sqlx::Error> {
        let query = format!(
            "INSERT INTO users \
                (label_studio_id, email, first_name, last_name, last_activity, date_joined) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (email) DO UPDATE SET \
                label_studio_id = COALESCE(EXCLUDED.label_studio_id, users.label_studio_id), \
                first_name = EXCLUDED.first_name, \
                last_name = EXCLUDED.last_name, \
                last_activity = EXCLUDED.last_activity, \
                date_joined = EXCLUDED.date_joined, \
                updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, User>(&query)
            .bind(input.label_studio_id)
            .bind(&input.email)
            .bind(&input.first_name)
            .bind(&input.last_name)
            .bind(input.last_activity)
            .bind(input.date_joined)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_email<'e>(
        executor: impl PgExecutor<'e>,
        email: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM users WHERE email = $1");
        sqlx::query_as::<_, User>(&query)
            .bind(email)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_label_studio_id<'e>(
        executor: impl PgExecutor<'e>,
        label_studio_id: i64,
    ) -> Result<Option<User>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM users WHERE label_studio_id = $1");
        sqlx::query_as::<_, User>(&query)
            .bind(label_studio_id)
            .fetch_optional(executor)
            .await
    }

    /// Import a Label Studio user listing in one transaction.
    pub async fn import_label_studio_users(
        pool: &PgPool,
        users: &[LabelStudioUser],
    ) -> Result<Vec<User>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let imported = Self::import_label_studio_users_in_tx(&mut tx, users).await?;
        tx.commit().await?;
        Ok(imported)
    }

    /// Import a Label Studio user listing within an existing transaction.
    pub async fn import_label_studio_users_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        users: &[LabelStudioUser],
    ) -> Result<Vec<User>, sqlx::Error> {
        let mut imported = Vec::with_capacity(users.len());
        for user in users {
            imported.push(Self::upsert(&mut **tx, &UpsertUser::from(user)).await?);
        }
        tracing::debug!(count = imported.len(), "Imported Label Studio users");
        Ok(imported)
    }
}
