//! The queue, store and clock a pipeline runs against.

use contentflow_config::RuntimeConfig;
use contentflow_core::{Clock, SystemClock};
use contentflow_db::{
    DurableQueue, MemoryQueue, MemoryStore, PgPipelineStore, PgQueue, PipelineStore, create_pool,
    run_migrations,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::SchedulerResult;

/// Shared handles to the queue and store.
///
/// The clock must be the one the backends use so that lease checks made by
/// workers agree with the store's view of time.
#[derive(Clone)]
pub struct Backend {
    pub queue: Arc<dyn DurableQueue>,
    pub store: Arc<dyn PipelineStore>,
    pub clock: Arc<dyn Clock>,
}

impl Backend {
    pub fn new(queue: Arc<dyn DurableQueue>, store: Arc<dyn PipelineStore>) -> Self {
        Self {
            queue,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// PostgreSQL queue and store sharing one pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(
            Arc::new(PgQueue::new(pool.clone())),
            Arc::new(PgPipelineStore::new(pool)),
        )
    }

    /// Connect to the configured database and bring its schema up to date.
    pub async fn connect(config: &RuntimeConfig) -> SchedulerResult<Self> {
        info!(
            worker_id = %config.worker_id,
            max_connections = config.max_connections,
            "Connecting to database..."
        );
        let pool = create_pool(&config.database_url, config.max_connections).await?;
        run_migrations(&pool).await?;
        info!("Database connected");
        Ok(Self::postgres(pool))
    }

    /// In-memory queue and store driven by `clock`.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: Arc::new(MemoryQueue::with_clock(clock.clone())),
            store: Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
        }
    }
}
