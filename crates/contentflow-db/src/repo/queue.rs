//! Queue tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contentflow_core::{MessageBody, QueueMessage, QueueStats, ResourceId, StageName};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;

use crate::{DbError, DbResult, DurableQueue, duration_to_ms};

/// A queue message row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueMessageRecord {
    pub id: uuid::Uuid,
    pub queue_name: String,
    pub job_id: uuid::Uuid,
    pub body: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub delivery_count: i32,
}

impl TryFrom<QueueMessageRecord> for QueueMessage {
    type Error = DbError;

    fn try_from(record: QueueMessageRecord) -> Result<Self, Self::Error> {
        Ok(QueueMessage {
            id: ResourceId::from_uuid(record.id),
            queue: StageName::new(record.queue_name)?,
            body: serde_json::from_value(record.body)?,
            enqueued_at: record.enqueued_at,
            visible_at: record.visible_at,
            leased_at: record.leased_at,
            delivery_count: u32::try_from(record.delivery_count).unwrap_or(0),
        })
    }
}

/// PostgreSQL implementation of DurableQueue.
///
/// Dequeue uses `FOR UPDATE SKIP LOCKED` so concurrent consumers partition the
/// visible messages between them instead of blocking on each other.
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableQueue for PgQueue {
    async fn enqueue(&self, stage: &StageName, body: &MessageBody) -> DbResult<ResourceId> {
        self.enqueue_delayed(stage, body, Duration::ZERO).await
    }

    async fn enqueue_delayed(
        &self,
        stage: &StageName,
        body: &MessageBody,
        delay: Duration,
    ) -> DbResult<ResourceId> {
        let id = sqlx::query_scalar::<_, uuid::Uuid>(
            r#"
            INSERT INTO queue_messages (id, queue_name, job_id, body, enqueued_at, visible_at, delivery_count)
            VALUES ($1, $2, $3, $4, NOW(), NOW() + $5::float8 * INTERVAL '1 millisecond', 0)
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(stage.as_str())
        .bind(body.job_id.as_uuid())
        .bind(serde_json::to_value(body)?)
        .bind(duration_to_ms(delay))
        .fetch_one(&self.pool)
        .await?;
        Ok(ResourceId::from_uuid(id))
    }

    async fn dequeue(
        &self,
        stage: &StageName,
        visibility_timeout: Duration,
        max_count: usize,
    ) -> DbResult<Vec<QueueMessage>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, QueueMessageRecord>(
            r#"
            UPDATE queue_messages
            SET visible_at = NOW() + $3::float8 * INTERVAL '1 millisecond',
                leased_at = NOW(),
                delivery_count = delivery_count + 1
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(stage.as_str())
        .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
        .bind(duration_to_ms(visibility_timeout))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = records
            .into_iter()
            .map(QueueMessage::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn ack(&self, message_id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            WITH removed AS (
                DELETE FROM queue_messages WHERE id = $1
                RETURNING *
            )
            INSERT INTO queue_archive (id, queue_name, job_id, body, enqueued_at, delivery_count, archived_at)
            SELECT id, queue_name, job_id, body, enqueued_at, delivery_count, NOW() FROM removed
            "#,
        )
        .bind(message_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend_visibility(
        &self,
        message_id: ResourceId,
        timeout: Duration,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = NOW() + $2::float8 * INTERVAL '1 millisecond'
            WHERE id = $1 AND leased_at IS NOT NULL
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(duration_to_ms(timeout))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(&self, message_id: ResourceId, delay: Duration) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = NOW() + $2::float8 * INTERVAL '1 millisecond',
                leased_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(duration_to_ms(delay))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn has_message(&self, stage: &StageName, job_id: ResourceId) -> DbResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM queue_messages WHERE queue_name = $1 AND job_id = $2)",
        )
        .bind(stage.as_str())
        .bind(job_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn backlog_depth(&self, stage: &StageName) -> DbResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = $1 AND visible_at <= NOW()",
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn stats(&self, stage: &StageName) -> DbResult<QueueStats> {
        let (ready, in_flight, delayed) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE visible_at <= NOW()),
                COUNT(*) FILTER (WHERE visible_at > NOW() AND leased_at IS NOT NULL),
                COUNT(*) FILTER (WHERE visible_at > NOW() AND leased_at IS NULL)
            FROM queue_messages
            WHERE queue_name = $1
            "#,
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            ready: u64::try_from(ready).unwrap_or(0),
            in_flight: u64::try_from(in_flight).unwrap_or(0),
            delayed: u64::try_from(delayed).unwrap_or(0),
        })
    }
}

/// Integration tests that require PostgreSQL.
/// Run with: DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn queue() -> PgQueue {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url, 5).await.unwrap();
        run_migrations(&pool).await.unwrap();
        PgQueue::new(pool)
    }

    /// A queue name no other test run shares.
    fn fresh_stage() -> StageName {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        StageName::new(format!("q{}", &suffix[..16])).unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_enqueue_dequeue_ack() {
        let queue = queue().await;
        let stage = fresh_stage();
        let body = MessageBody::new(ResourceId::new(), stage.clone());

        let id = queue.enqueue(&stage, &body).await.unwrap();
        assert_eq!(queue.backlog_depth(&stage).await.unwrap(), 1);

        let leased = queue
            .dequeue(&stage, Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, id);
        assert_eq!(leased[0].body, body);
        assert_eq!(leased[0].delivery_count, 1);

        let stats = queue.stats(&stage).await.unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.in_flight, 1);

        assert!(queue.ack(id).await.unwrap());
        assert!(!queue.ack(id).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_concurrent_dequeue_skips_locked_rows() {
        let queue = std::sync::Arc::new(queue().await);
        let stage = fresh_stage();
        for _ in 0..10 {
            queue
                .enqueue(&stage, &MessageBody::new(ResourceId::new(), stage.clone()))
                .await
                .unwrap();
        }

        let consumers = (0..5).map(|_| {
            let queue = queue.clone();
            let stage = stage.clone();
            async move {
                queue
                    .dequeue(&stage, Duration::from_secs(30), 4)
                    .await
                    .unwrap()
            }
        });
        let mut ids: Vec<ResourceId> = futures::future::join_all(consumers)
            .await
            .into_iter()
            .flatten()
            .map(|m| m.id)
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total, "a message was delivered twice");
        assert_eq!(total, 10);
    }

    #[tokio::test]
    #[ignore]
    async fn test_reschedule_hides_message() {
        let queue = queue().await;
        let stage = fresh_stage();
        let id = queue
            .enqueue(&stage, &MessageBody::new(ResourceId::new(), stage.clone()))
            .await
            .unwrap();
        queue
            .dequeue(&stage, Duration::from_secs(30), 1)
            .await
            .unwrap();

        assert!(queue.reschedule(id, Duration::from_secs(60)).await.unwrap());
        let stats = queue.stats(&stage).await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_has_message_sees_delayed_and_leased() {
        let queue = queue().await;
        let stage = fresh_stage();
        let job_id = ResourceId::new();
        assert!(!queue.has_message(&stage, job_id).await.unwrap());

        let id = queue
            .enqueue_delayed(
                &stage,
                &MessageBody::new(job_id, stage.clone()),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(queue.has_message(&stage, job_id).await.unwrap());
        assert!(!queue.has_message(&stage, ResourceId::new()).await.unwrap());

        assert!(queue.ack(id).await.unwrap());
        assert!(!queue.has_message(&stage, job_id).await.unwrap());
    }
}
