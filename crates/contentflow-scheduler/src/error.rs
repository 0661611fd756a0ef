//! Scheduler errors.

use contentflow_core::StageName;
use contentflow_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Db(#[from] DbError),

    #[error("configuration error: {0}")]
    Config(#[from] contentflow_config::ConfigError),

    #[error("no handler registered for stage '{0}'")]
    MissingHandler(StageName),

    #[error("stage '{0}' is not part of the pipeline")]
    UnknownStage(StageName),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl SchedulerError {
    /// Lift store conflicts to the scheduler's own variant.
    pub(crate) fn from_db(err: DbError) -> Self {
        match err {
            DbError::Conflict(msg) => SchedulerError::Conflict(msg),
            other => SchedulerError::Db(other),
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
