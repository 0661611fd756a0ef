//! Durable per-stage message queue.

use async_trait::async_trait;
use contentflow_core::{MessageBody, QueueMessage, QueueStats, ResourceId, StageName};
use std::time::Duration;

use crate::DbResult;

/// At-least-once queue with lease-based delivery.
///
/// A dequeued message stays invisible for its visibility timeout. If it is not
/// acked in time it becomes visible again and is redelivered; no explicit nack
/// exists. This is what lets a crashed worker's message be picked up by another.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append a message to a stage's queue.
    async fn enqueue(&self, stage: &StageName, body: &MessageBody) -> DbResult<ResourceId>;

    /// Append a message that only becomes visible after `delay`.
    async fn enqueue_delayed(
        &self,
        stage: &StageName,
        body: &MessageBody,
        delay: Duration,
    ) -> DbResult<ResourceId>;

    /// Lease up to `max_count` visible messages for `visibility_timeout`.
    ///
    /// Concurrent callers never receive the same message.
    async fn dequeue(
        &self,
        stage: &StageName,
        visibility_timeout: Duration,
        max_count: usize,
    ) -> DbResult<Vec<QueueMessage>>;

    /// Archive a message after successful processing. Returns false if the
    /// message was already gone.
    async fn ack(&self, message_id: ResourceId) -> DbResult<bool>;

    /// Push a leased message's visibility deadline out to `now + timeout`.
    async fn extend_visibility(&self, message_id: ResourceId, timeout: Duration)
    -> DbResult<bool>;

    /// Release the lease on a message and redeliver it after `delay`.
    async fn reschedule(&self, message_id: ResourceId, delay: Duration) -> DbResult<bool>;

    /// Whether any message for `job_id` sits in the stage's queue, whether it
    /// is ready, in flight or delayed.
    async fn has_message(&self, stage: &StageName, job_id: ResourceId) -> DbResult<bool>;

    /// Number of visible messages waiting for a consumer.
    async fn backlog_depth(&self, stage: &StageName) -> DbResult<u64>;

    /// Ready, in-flight and delayed counts for a stage's queue.
    async fn stats(&self, stage: &StageName) -> DbResult<QueueStats>;
}
