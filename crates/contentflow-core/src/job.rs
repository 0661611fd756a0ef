//! Jobs: one per unit of content to produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ResourceId, RetryPolicy, StageName};

/// Overall status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no stage has started yet.
    Queued,
    /// At least one stage has been leased.
    Processing,
    /// The final stage completed.
    Completed,
    /// The current stage was dead-lettered.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// A job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    /// Kind of content, e.g. "article".
    pub job_type: String,
    pub status: JobStatus,
    /// Stage the job is at or was last at.
    pub current_stage: Option<StageName>,
    /// Ceiling on attempts for any single stage of this job.
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}
