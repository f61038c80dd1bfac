//! PostgreSQL persistence for dives, images, labels, frame clusters and the
//! workflow task queue.
//!
//! Repositories are zero-sized structs. Single-statement methods take any
//! `PgExecutor`, so callers pass `&PgPool` for a standalone statement or
//! `&mut *tx` to join their own transaction. Multi-statement operations come
//! in pairs: `*_in_tx` runs inside a caller's transaction, the plain variant
//! opens and commits its own.

pub mod models;
pub mod repositories;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from pre-built connect options (TLS material,
/// host overrides).
pub async fn connect_with(
    options: PgConnectOptions,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
}

/// Round-trip a trivial query to confirm the pool is usable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Applying database migrations");
    sqlx::migrate!("../../db/migrations").run(pool).await
}
