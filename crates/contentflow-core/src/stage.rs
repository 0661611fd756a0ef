//! Stage rows: one per (job, stage name) pair visited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, ResourceId, RetryPolicy, StageName};

/// Status of a stage row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting to be leased (possibly after a backoff deadline).
    Pending,
    /// Leased by a worker that has not yet begun the stage's work.
    Leased,
    /// The lease holder is running the stage's work.
    Processing,
    Completed,
    /// An attempt failed. Only appears in events; the row itself moves on to
    /// `Pending` or `DeadLettered` in the same operation.
    Failed,
    /// Retry budget exhausted or permanent error. Needs an operator.
    DeadLettered,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Leased => "leased",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::DeadLettered)
    }

    /// Leased or processing.
    pub fn is_active(&self) -> bool {
        matches!(self, StageStatus::Leased | StageStatus::Processing)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "leased" => Ok(StageStatus::Leased),
            "processing" => Ok(StageStatus::Processing),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            "dead_lettered" => Ok(StageStatus::DeadLettered),
            other => Err(Error::InvalidInput(format!(
                "unknown stage status: {}",
                other
            ))),
        }
    }
}

/// A stage row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub job_id: ResourceId,
    pub name: StageName,
    pub status: StageStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Delay the row started with; restored on redrive.
    pub base_retry_delay: Duration,
    /// Delay applied to the next retry. Grows with each retry.
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    pub max_retry_delay: Duration,
    /// A pending stage may not be leased before this instant.
    pub available_at: DateTime<Utc>,
    /// Heartbeat deadline while leased or processing.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stage {
    /// Build a fresh pending row from a spec.
    pub fn from_spec(job_id: ResourceId, spec: &StageSpec, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            name: spec.name.clone(),
            status: StageStatus::Pending,
            attempt_count: 0,
            max_attempts: spec.max_attempts,
            base_retry_delay: spec.retry_delay,
            retry_delay: spec.retry_delay,
            backoff_factor: spec.backoff_factor,
            max_retry_delay: spec.max_retry_delay,
            available_at: now,
            lease_expires_at: None,
            last_error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Whether some worker holds an unexpired lease at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    /// The compare half of `start_stage`'s compare-and-set.
    pub fn can_start(&self, now: DateTime<Utc>) -> bool {
        if self.attempts_exhausted() {
            return false;
        }
        match self.status {
            StageStatus::Pending => self.available_at <= now,
            StageStatus::Leased | StageStatus::Processing => {
                self.lease_expires_at.is_none_or(|at| at <= now)
            }
            _ => false,
        }
    }
}

/// Parameters for creating a stage row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: StageName,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    pub max_retry_delay: Duration,
}

impl StageSpec {
    pub fn new(name: StageName, policy: &RetryPolicy) -> Self {
        Self {
            name,
            max_attempts: policy.max_attempts,
            retry_delay: policy.retry_delay,
            backoff_factor: policy.backoff_factor,
            max_retry_delay: policy.max_retry_delay,
        }
    }

    /// Cap the attempt budget, e.g. by the owning job's policy.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Proof that `start_stage` succeeded.
///
/// `attempt` fences every later write for this lease: once another worker
/// re-leases the stage the attempt number moves on and stale writes are refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLease {
    pub job_id: ResourceId,
    pub stage: StageName,
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
}
