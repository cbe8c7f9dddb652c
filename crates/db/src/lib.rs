//! Persistence for analyses and the analysis job queue.
//!
//! The pipeline talks to [`AnalysisStore`] and [`JobQueue`]. Two
//! implementations exist: Postgres ([`pg`], built on the zero-sized
//! repositories in [`repositories`]) and in-process ([`memory`]) for tests
//! and single-binary development runs.

use sqlx::postgres::PgPoolOptions;

pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod repositories;
pub mod store;

pub use error::StoreError;
pub use memory::{InMemoryAnalysisStore, InMemoryJobQueue};
pub use pg::{PgAnalysisStore, PgJobQueue};
pub use store::{AnalysisStore, ClaimedJob, JobQueue, NewAnalysis};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to prove the pool is usable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations under `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
