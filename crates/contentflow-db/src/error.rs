//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<contentflow_core::Error> for DbError {
    fn from(err: contentflow_core::Error) -> Self {
        match err {
            contentflow_core::Error::NotFound(msg) => DbError::NotFound(msg),
            contentflow_core::Error::Conflict(msg) => DbError::Conflict(msg),
            other => DbError::Corrupt(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
