//! Durable queue and pipeline store for contentflow.
//!
//! Provides the `DurableQueue` and `PipelineStore` traits, PostgreSQL
//! implementations, and in-memory implementations for tests and embedding.

pub mod error;
pub mod memory;
pub mod queue;
pub mod repo;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::{MemoryQueue, MemoryStore};
pub use queue::DurableQueue;
pub use repo::{PgPipelineStore, PgQueue};
pub use store::{FailOutcome, JobStatusReport, PipelineStore, StageCounts};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    debug!(max_connections, "Database pool created");
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    let migrator = sqlx::migrate!("./migrations");
    info!(migrations = migrator.iter().count(), "Running database migrations");
    migrator.run(pool).await?;
    Ok(())
}

/// Milliseconds as stored in `BIGINT` columns.
pub(crate) fn duration_to_ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn ms_to_duration(ms: i64) -> std::time::Duration {
    std::time::Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}
