//! In-memory queue and store.
//!
//! Same contracts as the PostgreSQL implementations, with all state behind one
//! lock per backend. Used by tests and by single-process embeddings that do not
//! need durability across restarts.

pub mod queue;
pub mod store;

pub use queue::MemoryQueue;
pub use store::MemoryStore;
