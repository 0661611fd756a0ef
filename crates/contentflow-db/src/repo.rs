//! PostgreSQL implementations.

pub mod pipeline;
pub mod queue;

pub use pipeline::PgPipelineStore;
pub use queue::PgQueue;
