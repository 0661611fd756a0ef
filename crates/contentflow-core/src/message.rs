//! Messages carried by the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceId, StageName};

/// Routing information only. The data a stage works on lives in the payload store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub job_id: ResourceId,
    pub stage: StageName,
}

impl MessageBody {
    pub fn new(job_id: ResourceId, stage: StageName) -> Self {
        Self { job_id, stage }
    }
}

/// A message as seen by a dequeuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: ResourceId,
    /// Queue the message belongs to; one queue per stage.
    pub queue: StageName,
    pub body: MessageBody,
    pub enqueued_at: DateTime<Utc>,
    /// The message is invisible to dequeuers until this instant.
    pub visible_at: DateTime<Utc>,
    /// Set while a consumer holds the message, cleared when it is rescheduled.
    pub leased_at: Option<DateTime<Utc>>,
    /// Number of times the message has been handed to a consumer.
    pub delivery_count: u32,
}

impl QueueMessage {
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }

    pub fn is_in_flight(&self, now: DateTime<Utc>) -> bool {
        self.leased_at.is_some() && self.visible_at > now
    }

    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.leased_at.is_none() && self.visible_at > now
    }
}

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Visible and waiting for a consumer.
    pub ready: u64,
    /// Leased and not yet timed out.
    pub in_flight: u64,
    /// Scheduled for later delivery (retry backoff).
    pub delayed: u64,
}
