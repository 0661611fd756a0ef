//! Stage handler trait and its inputs and errors.
//!
//! Handlers hold a stage's business logic (LLM calls, parsing, rendering).
//! The scheduler's worker harness invokes them; they never touch the queue or
//! the store directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::payload::PriorPayloads;
use crate::{Job, StageName};

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout, rate limit, upstream 5xx. Retried with backoff.
    Transient,
    /// Malformed input or missing prior output. Dead-lettered at once.
    Permanent,
    /// The job was cancelled. Dead-lettered at once.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Failure of a single stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{} error: {message}", .kind.as_str())]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }
}

/// Raised by the harness when the handler should give up early: the job was
/// cancelled or the lease was lost.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job: Job,
    pub stage: StageName,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Newest payload of every earlier stage (and intake).
    pub prior: PriorPayloads,
    pub stop: StopSignal,
}

impl StageContext {
    /// Cooperative cancellation check for long-running handlers.
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_stopped()
    }
}

/// Business logic for one stage.
///
/// Delivery is at-least-once, so `run` may be called again for the same job
/// and stage; its external side effects must be safe to repeat.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Produce this stage's payload from the prior ones.
    async fn run(&self, ctx: StageContext) -> Result<serde_json::Value, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobStatus, ResourceId};
    use chrono::Utc;

    struct Echo;

    #[async_trait]
    impl StageHandler for Echo {
        async fn run(&self, ctx: StageContext) -> Result<serde_json::Value, StageError> {
            if ctx.is_cancelled() {
                return Err(StageError::cancelled());
            }
            Ok(serde_json::json!({ "stage": ctx.stage.as_str(), "attempt": ctx.attempt }))
        }
    }

    fn context() -> StageContext {
        let now = Utc::now();
        StageContext {
            job: Job {
                id: ResourceId::new(),
                job_type: "article".to_string(),
                status: JobStatus::Processing,
                current_stage: None,
                max_attempts: 3,
                created_at: now,
                updated_at: now,
            },
            stage: StageName::new("draft").unwrap(),
            attempt: 1,
            prior: PriorPayloads::default(),
            stop: StopSignal::new(),
        }
    }

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(StageError::transient("timeout").kind.should_retry());
        assert!(!StageError::permanent("bad input").kind.should_retry());
        assert!(!StageError::cancelled().kind.should_retry());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            StageError::transient("rate limited").to_string(),
            "transient error: rate limited"
        );
    }

    #[tokio::test]
    async fn test_handler_observes_stop_signal() {
        let ctx = context();
        let out = Echo.run(ctx.clone()).await.unwrap();
        assert_eq!(out["stage"], "draft");

        ctx.stop.stop();
        let err = Echo.run(ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
