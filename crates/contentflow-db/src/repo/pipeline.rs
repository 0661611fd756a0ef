//! Job, stage, payload, event and dead-letter tables.
//!
//! Every mutating method is a single statement. Data-modifying CTEs keep the
//! stage transition, its payload or dead letter, the job row and the audit
//! events in one atomic unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contentflow_core::{
    DeadLetter, ErrorKind, Event, Job, NewEvent, NewJob, Payload, ResourceId, Stage, StageError,
    StageLease, StageName, StageSpec,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;

use crate::store::{FailOutcome, JobStatusReport, PipelineStore, StageCounts};
use crate::{DbError, DbResult, duration_to_ms, ms_to_duration};

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// A job record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub job_type: String,
    pub status: String,
    pub current_stage: Option<String>,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        Ok(Job {
            id: ResourceId::from_uuid(record.id),
            job_type: record.job_type,
            status: record.status.parse()?,
            current_stage: record.current_stage.map(StageName::new).transpose()?,
            max_attempts: to_u32(record.max_attempts),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// A stage record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StageRecord {
    pub job_id: uuid::Uuid,
    pub stage_name: String,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub base_retry_delay_ms: i64,
    pub retry_delay_ms: i64,
    pub backoff_factor: f64,
    pub max_retry_delay_ms: i64,
    pub available_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<StageRecord> for Stage {
    type Error = DbError;

    fn try_from(record: StageRecord) -> Result<Self, Self::Error> {
        Ok(Stage {
            job_id: ResourceId::from_uuid(record.job_id),
            name: StageName::new(record.stage_name)?,
            status: record.status.parse()?,
            attempt_count: to_u32(record.attempt_count),
            max_attempts: to_u32(record.max_attempts),
            base_retry_delay: ms_to_duration(record.base_retry_delay_ms),
            retry_delay: ms_to_duration(record.retry_delay_ms),
            backoff_factor: record.backoff_factor,
            max_retry_delay: ms_to_duration(record.max_retry_delay_ms),
            available_at: record.available_at,
            lease_expires_at: record.lease_expires_at,
            last_error: record.last_error,
            started_at: record.started_at,
            finished_at: record.finished_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// A stage output record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PayloadRecord {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub stage_name: String,
    pub attempt: i32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PayloadRecord> for Payload {
    type Error = DbError;

    fn try_from(record: PayloadRecord) -> Result<Self, Self::Error> {
        Ok(Payload {
            id: ResourceId::from_uuid(record.id),
            job_id: ResourceId::from_uuid(record.job_id),
            stage: StageName::new(record.stage_name)?,
            attempt: to_u32(record.attempt),
            data: record.data,
            created_at: record.created_at,
        })
    }
}

/// An audit event record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub stage_name: Option<String>,
    pub status: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EventRecord> for Event {
    type Error = DbError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        Ok(Event {
            id: ResourceId::from_uuid(record.id),
            job_id: ResourceId::from_uuid(record.job_id),
            stage: record.stage_name.map(StageName::new).transpose()?,
            status: record.status,
            message: record.message,
            metadata: record.metadata,
            created_at: record.created_at,
        })
    }
}

/// A dead letter record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterRecord {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub stage_name: String,
    pub snapshot: serde_json::Value,
    pub reason: String,
    pub attempt_count: i32,
    pub routed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

impl TryFrom<DeadLetterRecord> for DeadLetter {
    type Error = DbError;

    fn try_from(record: DeadLetterRecord) -> Result<Self, Self::Error> {
        Ok(DeadLetter {
            id: ResourceId::from_uuid(record.id),
            job_id: ResourceId::from_uuid(record.job_id),
            stage: StageName::new(record.stage_name)?,
            snapshot: record.snapshot,
            reason: record.reason,
            attempt_count: to_u32(record.attempt_count),
            routed_at: record.routed_at,
            resolved_at: record.resolved_at,
            resolution: record.resolution,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StageCountsRecord {
    stage_name: String,
    pending: i64,
    active: i64,
    completed: i64,
    dead_lettered: i64,
}

fn convert_all<R, T>(records: Vec<R>) -> DbResult<Vec<T>>
where
    T: TryFrom<R, Error = DbError>,
{
    records.into_iter().map(T::try_from).collect()
}

/// PostgreSQL implementation of PipelineStore.
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn create_job(&self, job: NewJob) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            WITH job AS (
                INSERT INTO pipeline_jobs (id, job_type, status, max_attempts, created_at, updated_at)
                VALUES ($1, $2, 'queued', $3, NOW(), NOW())
                RETURNING *
            ), event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $4, id, NULL, 'queued', 'job created', '{}'::jsonb, NOW() FROM job
            )
            SELECT * FROM job
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&job.job_type)
        .bind(to_i32(job.max_attempts.max(1)))
        .bind(uuid::Uuid::now_v7())
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn get_job(&self, job_id: ResourceId) -> DbResult<Job> {
        let record =
            sqlx::query_as::<_, JobRecord>("SELECT * FROM pipeline_jobs WHERE id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))?;
        record.try_into()
    }

    async fn cancel_job(&self, job_id: ResourceId, reason: &str) -> DbResult<bool> {
        let cancelled = sqlx::query_scalar::<_, i64>(
            r#"
            WITH cancelled AS (
                UPDATE pipeline_jobs SET status = 'cancelled', updated_at = NOW()
                WHERE id = $1 AND status IN ('queued', 'processing', 'failed')
                RETURNING id
            ), resolved AS (
                UPDATE dead_letters SET resolved_at = NOW(), resolution = 'job cancelled'
                WHERE job_id IN (SELECT id FROM cancelled) AND resolved_at IS NULL
            ), event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $2, id, NULL, 'cancelled', $3, '{}'::jsonb, NOW() FROM cancelled
            )
            SELECT COUNT(*) FROM cancelled
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(uuid::Uuid::now_v7())
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        if cancelled == 0 {
            // Distinguish "already finished" from "no such job".
            self.get_job(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn create_or_get_stage(&self, job_id: ResourceId, spec: &StageSpec) -> DbResult<Stage> {
        let record = sqlx::query_as::<_, StageRecord>(
            r#"
            WITH inserted AS (
                INSERT INTO pipeline_stages (job_id, stage_name, status, attempt_count, max_attempts,
                    base_retry_delay_ms, retry_delay_ms, backoff_factor, max_retry_delay_ms,
                    available_at, created_at, updated_at)
                SELECT id, $2, 'pending', 0, $3, $4, $4, $5, $6, NOW(), NOW(), NOW()
                FROM pipeline_jobs WHERE id = $1
                ON CONFLICT (job_id, stage_name) DO NOTHING
                RETURNING *
            ), job AS (
                UPDATE pipeline_jobs
                SET current_stage = COALESCE(current_stage, $2), updated_at = NOW()
                WHERE id = $1
            ), event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $7, job_id, stage_name, 'pending', 'stage created', '{}'::jsonb, NOW()
                FROM inserted
            )
            SELECT * FROM inserted
            UNION ALL
            SELECT * FROM pipeline_stages WHERE job_id = $1 AND stage_name = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(spec.name.as_str())
        .bind(to_i32(spec.max_attempts))
        .bind(duration_to_ms(spec.retry_delay))
        .bind(spec.backoff_factor)
        .bind(duration_to_ms(spec.max_retry_delay))
        .bind(uuid::Uuid::now_v7())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = record {
            return record.try_into();
        }
        // A concurrent insert committed after this statement's snapshot.
        self.get_stage(job_id, &spec.name)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))
    }

    async fn get_stage(&self, job_id: ResourceId, stage: &StageName) -> DbResult<Option<Stage>> {
        let record = sqlx::query_as::<_, StageRecord>(
            "SELECT * FROM pipeline_stages WHERE job_id = $1 AND stage_name = $2",
        )
        .bind(job_id.as_uuid())
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        record.map(Stage::try_from).transpose()
    }

    async fn list_stages(&self, job_id: ResourceId) -> DbResult<Vec<Stage>> {
        let records = sqlx::query_as::<_, StageRecord>(
            "SELECT * FROM pipeline_stages WHERE job_id = $1 ORDER BY created_at, stage_name",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn start_stage(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        lease_duration: Duration,
    ) -> DbResult<Option<StageLease>> {
        // Concurrent callers serialize on the row lock; the loser re-checks the
        // WHERE clause against the winner's row and matches nothing.
        let record = sqlx::query_as::<_, StageRecord>(
            r#"
            WITH leased AS (
                UPDATE pipeline_stages
                SET status = 'leased',
                    attempt_count = attempt_count + 1,
                    lease_expires_at = NOW() + $3::float8 * INTERVAL '1 millisecond',
                    started_at = COALESCE(started_at, NOW()),
                    updated_at = NOW()
                WHERE job_id = $1 AND stage_name = $2
                  AND attempt_count < max_attempts
                  AND (
                    (status = 'pending' AND available_at <= NOW())
                    OR (status IN ('leased', 'processing')
                        AND (lease_expires_at IS NULL OR lease_expires_at <= NOW()))
                  )
                RETURNING *
            ), event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $4, job_id, stage_name, 'leased',
                       'attempt ' || attempt_count || ' leased',
                       jsonb_build_object('attempt', attempt_count), NOW()
                FROM leased
            )
            SELECT * FROM leased
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(stage.as_str())
        .bind(duration_to_ms(lease_duration))
        .bind(uuid::Uuid::now_v7())
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };
        let stage: Stage = record.try_into()?;
        let expires_at = stage
            .lease_expires_at
            .ok_or_else(|| DbError::Corrupt(format!("leased stage {} has no expiry", stage.name)))?;
        Ok(Some(StageLease {
            job_id,
            stage: stage.name,
            attempt: stage.attempt_count,
            expires_at,
        }))
    }

    async fn begin_processing(&self, lease: &StageLease) -> DbResult<bool> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            WITH stage AS (
                UPDATE pipeline_stages SET status = 'processing', updated_at = NOW()
                WHERE job_id = $1 AND stage_name = $2 AND attempt_count = $3
                  AND status = 'leased' AND lease_expires_at > NOW()
                RETURNING job_id, stage_name, attempt_count
            ), job AS (
                UPDATE pipeline_jobs
                SET status = CASE WHEN status = 'queued' THEN 'processing' ELSE status END,
                    current_stage = $2,
                    updated_at = NOW()
                WHERE id IN (SELECT job_id FROM stage)
            ), event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $4, job_id, stage_name, 'processing',
                       'attempt ' || attempt_count || ' processing',
                       jsonb_build_object('attempt', attempt_count), NOW()
                FROM stage
            )
            SELECT COUNT(*) FROM stage
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.stage.as_str())
        .bind(to_i32(lease.attempt))
        .bind(uuid::Uuid::now_v7())
        .fetch_one(&self.pool)
        .await?;
        Ok(updated > 0)
    }

    async fn extend_lease(&self, lease: &StageLease, lease_duration: Duration) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_stages
            SET lease_expires_at = NOW() + $4::float8 * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE job_id = $1 AND stage_name = $2 AND attempt_count = $3
              AND status IN ('leased', 'processing')
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.stage.as_str())
        .bind(to_i32(lease.attempt))
        .bind(duration_to_ms(lease_duration))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_stage(
        &self,
        lease: &StageLease,
        payload: serde_json::Value,
        next: Option<&StageSpec>,
    ) -> DbResult<bool> {
        let completed = sqlx::query_scalar::<_, i64>(
            r#"
            WITH done AS (
                UPDATE pipeline_stages
                SET status = 'completed', lease_expires_at = NULL, last_error = NULL,
                    finished_at = NOW(), updated_at = NOW()
                WHERE job_id = $1 AND stage_name = $2 AND attempt_count = $3
                  AND status IN ('leased', 'processing')
                RETURNING job_id
            ), payload AS (
                INSERT INTO stage_payloads (id, job_id, stage_name, attempt, data, created_at)
                SELECT $4, job_id, $2, $3, $5, NOW() FROM done
            ), job AS (
                UPDATE pipeline_jobs
                SET status = CASE WHEN $6::text IS NULL THEN 'completed' ELSE 'processing' END,
                    current_stage = COALESCE($6::text, current_stage),
                    updated_at = NOW()
                WHERE id IN (SELECT job_id FROM done) AND status <> 'cancelled'
                RETURNING id
            ), next_stage AS (
                INSERT INTO pipeline_stages (job_id, stage_name, status, attempt_count, max_attempts,
                    base_retry_delay_ms, retry_delay_ms, backoff_factor, max_retry_delay_ms,
                    available_at, created_at, updated_at)
                SELECT id, $6::text, 'pending', 0, $7, $8, $8, $9, $10, NOW(), NOW(), NOW()
                FROM job WHERE $6::text IS NOT NULL
                ON CONFLICT (job_id, stage_name) DO NOTHING
                RETURNING job_id, stage_name
            ), stage_event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $11, job_id, $2, 'completed', 'stage completed',
                       jsonb_build_object('attempt', $3::int), NOW()
                FROM done
            ), follow_event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $12, job_id, stage_name, 'pending', 'stage created', '{}'::jsonb, NOW()
                FROM next_stage
                UNION ALL
                SELECT $12, id, NULL, 'completed', 'job completed', '{}'::jsonb, NOW()
                FROM job WHERE $6::text IS NULL
            )
            SELECT COUNT(*) FROM done
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.stage.as_str())
        .bind(to_i32(lease.attempt))
        .bind(uuid::Uuid::now_v7())
        .bind(payload)
        .bind(next.map(|s| s.name.as_str()))
        .bind(next.map(|s| to_i32(s.max_attempts)))
        .bind(next.map(|s| duration_to_ms(s.retry_delay)))
        .bind(next.map(|s| s.backoff_factor))
        .bind(next.map(|s| duration_to_ms(s.max_retry_delay)))
        .bind(uuid::Uuid::now_v7())
        .bind(uuid::Uuid::now_v7())
        .fetch_one(&self.pool)
        .await?;
        Ok(completed > 0)
    }

    async fn fail_stage(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        attempt: Option<u32>,
        error: &StageError,
        snapshot: serde_json::Value,
    ) -> DbResult<FailOutcome> {
        let dead_letter_id = uuid::Uuid::now_v7();
        let row = sqlx::query_as::<_, (i32, bool, i64)>(
            r#"
            WITH target AS (
                SELECT job_id, stage_name, retry_delay_ms, backoff_factor, max_retry_delay_ms,
                       ($4 AND attempt_count < max_attempts) AS will_retry
                FROM pipeline_stages
                WHERE job_id = $1 AND stage_name = $2
                  AND (
                    ($3::int IS NULL AND status IN ('pending', 'leased', 'processing'))
                    OR (status IN ('leased', 'processing') AND attempt_count = $3::int)
                  )
                FOR UPDATE
            ), updated AS (
                UPDATE pipeline_stages s
                SET status = CASE WHEN t.will_retry THEN 'pending' ELSE 'dead_lettered' END,
                    available_at = CASE WHEN t.will_retry
                        THEN NOW() + t.retry_delay_ms::float8 * INTERVAL '1 millisecond'
                        ELSE s.available_at END,
                    retry_delay_ms = CASE WHEN t.will_retry
                        THEN LEAST((t.retry_delay_ms * GREATEST(t.backoff_factor, 1.0))::bigint,
                                   t.max_retry_delay_ms)
                        ELSE s.retry_delay_ms END,
                    lease_expires_at = NULL,
                    last_error = $5,
                    finished_at = CASE WHEN t.will_retry THEN s.finished_at ELSE NOW() END,
                    updated_at = NOW()
                FROM target t
                WHERE s.job_id = t.job_id AND s.stage_name = t.stage_name
                RETURNING s.job_id, s.stage_name, s.attempt_count, t.will_retry,
                          t.retry_delay_ms AS delay_ms
            ), dead AS (
                INSERT INTO dead_letters (id, job_id, stage_name, snapshot, reason, attempt_count,
                    routed_at, resolved_at, resolution)
                SELECT $9, job_id, stage_name, $8, $5, attempt_count, NOW(),
                       CASE WHEN $10 THEN NOW() END,
                       CASE WHEN $10 THEN 'job cancelled' END
                FROM updated WHERE NOT will_retry
            ), job AS (
                UPDATE pipeline_jobs
                SET status = 'failed', current_stage = $2, updated_at = NOW()
                WHERE id IN (SELECT job_id FROM updated WHERE NOT will_retry)
                  AND status <> 'cancelled'
                RETURNING id
            ), stage_event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $11, job_id, stage_name,
                       CASE WHEN will_retry THEN 'pending' ELSE 'dead_lettered' END,
                       CASE WHEN will_retry
                            THEN 'attempt ' || attempt_count || ' failed, retrying in '
                                 || delay_ms || 'ms'
                            ELSE $5 END,
                       jsonb_build_object('attempt', attempt_count,
                                          'error_kind', $6::text, 'error', $7::text),
                       NOW()
                FROM updated
            ), job_event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $12, id, NULL, 'failed', 'stage ' || $2 || ' dead-lettered', '{}'::jsonb, NOW()
                FROM job
            )
            SELECT attempt_count, will_retry, delay_ms FROM updated
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(stage.as_str())
        .bind(attempt.map(to_i32))
        .bind(error.kind.should_retry())
        .bind(error.to_string())
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(snapshot)
        .bind(dead_letter_id)
        .bind(error.kind == ErrorKind::Cancelled)
        .bind(uuid::Uuid::now_v7())
        .bind(uuid::Uuid::now_v7())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => FailOutcome::Stale,
            Some((attempt, true, delay_ms)) => FailOutcome::Retrying {
                attempt: to_u32(attempt),
                delay: ms_to_duration(delay_ms),
            },
            Some((_, false, _)) => FailOutcome::DeadLettered {
                dead_letter_id: ResourceId::from_uuid(dead_letter_id),
            },
        })
    }

    async fn job_status(&self, job_id: ResourceId) -> DbResult<JobStatusReport> {
        let job = self.get_job(job_id).await?;
        let stages = self.list_stages(job_id).await?;
        Ok(JobStatusReport { job, stages })
    }

    async fn put_payload(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        data: serde_json::Value,
    ) -> DbResult<Payload> {
        let record = sqlx::query_as::<_, PayloadRecord>(
            r#"
            INSERT INTO stage_payloads (id, job_id, stage_name, attempt, data, created_at)
            SELECT $1, id, $3, 0, $4, NOW() FROM pipeline_jobs WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(job_id.as_uuid())
        .bind(stage.as_str())
        .bind(data)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))?;
        record.try_into()
    }

    async fn list_payloads(&self, job_id: ResourceId) -> DbResult<Vec<Payload>> {
        let records = sqlx::query_as::<_, PayloadRecord>(
            "SELECT * FROM stage_payloads WHERE job_id = $1 ORDER BY created_at, id",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn append_event(&self, event: NewEvent) -> DbResult<Event> {
        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
            SELECT $1, id, $3, $4, $5, $6, NOW() FROM pipeline_jobs WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(event.job_id.as_uuid())
        .bind(event.stage.as_ref().map(StageName::as_str))
        .bind(&event.status)
        .bind(&event.message)
        .bind(&event.metadata)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", event.job_id)))?;
        record.try_into()
    }

    async fn list_events(&self, job_id: ResourceId) -> DbResult<Vec<Event>> {
        let records = sqlx::query_as::<_, EventRecord>(
            "SELECT * FROM job_events WHERE job_id = $1 ORDER BY created_at, id",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn list_dead_letters(
        &self,
        stage: Option<&StageName>,
        include_resolved: bool,
    ) -> DbResult<Vec<DeadLetter>> {
        let records = sqlx::query_as::<_, DeadLetterRecord>(
            r#"
            SELECT * FROM dead_letters
            WHERE ($1::text IS NULL OR stage_name = $1)
              AND ($2 OR resolved_at IS NULL)
            ORDER BY routed_at DESC, id DESC
            "#,
        )
        .bind(stage.map(StageName::as_str))
        .bind(include_resolved)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn redrive_stage(&self, job_id: ResourceId, stage: &StageName) -> DbResult<Stage> {
        let record = sqlx::query_as::<_, StageRecord>(
            r#"
            WITH reset AS (
                UPDATE pipeline_stages
                SET status = 'pending', attempt_count = 0, retry_delay_ms = base_retry_delay_ms,
                    available_at = NOW(), lease_expires_at = NULL, last_error = NULL,
                    finished_at = NULL, updated_at = NOW()
                WHERE job_id = $1 AND stage_name = $2 AND status = 'dead_lettered'
                RETURNING *
            ), resolved AS (
                UPDATE dead_letters SET resolved_at = NOW(), resolution = 'redriven'
                WHERE job_id = $1 AND stage_name = $2 AND resolved_at IS NULL
                  AND EXISTS (SELECT 1 FROM reset)
            ), job AS (
                UPDATE pipeline_jobs
                SET status = 'processing', current_stage = $2, updated_at = NOW()
                WHERE id IN (SELECT job_id FROM reset)
            ), event AS (
                INSERT INTO job_events (id, job_id, stage_name, status, message, metadata, created_at)
                SELECT $3, job_id, stage_name, 'pending', 'stage redriven by operator',
                       jsonb_build_object('previous_attempts',
                           (SELECT attempt_count FROM pipeline_stages
                            WHERE job_id = $1 AND stage_name = $2)),
                       NOW()
                FROM reset
            )
            SELECT * FROM reset
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(stage.as_str())
        .bind(uuid::Uuid::now_v7())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = record {
            return record.try_into();
        }
        match self.get_stage(job_id, stage).await? {
            Some(current) => Err(DbError::Conflict(format!(
                "stage {} of job {} is {}, not dead_lettered",
                stage, job_id, current.status
            ))),
            None => Err(DbError::NotFound(format!(
                "stage {} of job {}",
                stage, job_id
            ))),
        }
    }

    async fn stage_counts(&self) -> DbResult<Vec<StageCounts>> {
        let records = sqlx::query_as::<_, StageCountsRecord>(
            r#"
            WITH stage_counts AS (
                SELECT stage_name,
                       COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                       COUNT(*) FILTER (WHERE status IN ('leased', 'processing')) AS active,
                       COUNT(*) FILTER (WHERE status = 'completed') AS completed
                FROM pipeline_stages
                GROUP BY stage_name
            ), open_dead_letters AS (
                SELECT stage_name, COUNT(*) AS dead_lettered
                FROM dead_letters
                WHERE resolved_at IS NULL
                GROUP BY stage_name
            )
            SELECT stage_name,
                   COALESCE(s.pending, 0) AS pending,
                   COALESCE(s.active, 0) AS active,
                   COALESCE(s.completed, 0) AS completed,
                   COALESCE(d.dead_lettered, 0) AS dead_lettered
            FROM stage_counts s
            FULL JOIN open_dead_letters d USING (stage_name)
            ORDER BY stage_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        records
            .into_iter()
            .map(|r| {
                Ok(StageCounts {
                    stage: StageName::new(r.stage_name)?,
                    pending: to_u64(r.pending),
                    active: to_u64(r.active),
                    completed: to_u64(r.completed),
                    dead_lettered: to_u64(r.dead_lettered),
                })
            })
            .collect()
    }
}
