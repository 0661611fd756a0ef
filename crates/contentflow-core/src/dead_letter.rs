//! Stages that exhausted their retry budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceId, StageName};

/// A dead-lettered stage awaiting an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub stage: StageName,
    /// Message body and the latest payloads at the moment of routing.
    pub snapshot: serde_json::Value,
    pub reason: String,
    pub attempt_count: u32,
    pub routed_at: DateTime<Utc>,
    /// Set once an operator redrives the stage or cancels the job.
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

impl DeadLetter {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
