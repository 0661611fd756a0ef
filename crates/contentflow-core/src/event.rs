//! Append-only audit trail of state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobStatus, ResourceId, StageName, StageStatus};

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: ResourceId,
    pub job_id: ResourceId,
    /// `None` for job-level events.
    pub stage: Option<StageName>,
    /// Status transitioned to.
    pub status: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An event before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub job_id: ResourceId,
    pub stage: Option<StageName>,
    pub status: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl NewEvent {
    pub fn job(job_id: ResourceId, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id,
            stage: None,
            status: status.as_str().to_string(),
            message: message.into(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn stage(
        job_id: ResourceId,
        stage: &StageName,
        status: StageStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            stage: Some(stage.clone()),
            status: status.as_str().to_string(),
            message: message.into(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn into_event(self, created_at: DateTime<Utc>) -> Event {
        Event {
            id: ResourceId::new(),
            job_id: self.job_id,
            stage: self.stage,
            status: self.status,
            message: self.message,
            metadata: self.metadata,
            created_at,
        }
    }
}
