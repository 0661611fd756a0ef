//! Job, stage, payload, event and dead-letter store.

use async_trait::async_trait;
use contentflow_core::{
    DeadLetter, Event, Job, JobStatus, NewEvent, NewJob, Payload, PriorPayloads, ResourceId,
    Stage, StageError, StageLease, StageName, StageSpec, StageStatus,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::DbResult;

/// What `fail_stage` did with the failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailOutcome {
    /// The stage is pending again and may be retried after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// The stage is dead-lettered.
    DeadLettered { dead_letter_id: ResourceId },
    /// The caller no longer holds the stage; nothing changed.
    Stale,
}

/// A job and all its stage rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job: Job,
    pub stages: Vec<Stage>,
}

impl JobStatusReport {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    pub fn stage(&self, name: &StageName) -> Option<&Stage> {
        self.stages.iter().find(|s| &s.name == name)
    }

    /// Job status as implied by the stage rows alone.
    ///
    /// Completion is only known to the job row (the store does not know which
    /// stage is last), so a job whose stages are all completed is reported as
    /// completed only when the row agrees.
    pub fn derived_status(&self) -> JobStatus {
        if self.job.status == JobStatus::Cancelled {
            return JobStatus::Cancelled;
        }
        if self
            .stages
            .iter()
            .any(|s| s.status == StageStatus::DeadLettered)
        {
            return JobStatus::Failed;
        }
        let untouched = self
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Pending && s.attempt_count == 0);
        if untouched && self.stages.len() <= 1 {
            return JobStatus::Queued;
        }
        let all_completed = self
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Completed);
        if all_completed && self.job.status == JobStatus::Completed {
            return JobStatus::Completed;
        }
        JobStatus::Processing
    }
}

/// Per-stage row counts across all jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub stage: StageName,
    pub pending: u64,
    /// Leased or processing.
    pub active: u64,
    pub completed: u64,
    /// Unresolved dead letters.
    pub dead_lettered: u64,
}

impl StageCounts {
    pub fn empty(stage: StageName) -> Self {
        Self {
            stage,
            pending: 0,
            active: 0,
            completed: 0,
            dead_lettered: 0,
        }
    }
}

/// The single source of truth for pipeline state.
///
/// Every mutating method is one atomic operation that also appends its audit
/// event. Stage writes after `start_stage` are fenced by the leased attempt
/// number so that a worker which lost its lease cannot advance the stage.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Create a job in `queued` status.
    async fn create_job(&self, job: NewJob) -> DbResult<Job>;

    async fn get_job(&self, job_id: ResourceId) -> DbResult<Job>;

    /// Mark a queued, processing or failed job cancelled and resolve its open
    /// dead letters. Returns false if the job was already completed or cancelled.
    async fn cancel_job(&self, job_id: ResourceId, reason: &str) -> DbResult<bool>;

    /// Create the stage row if missing; otherwise return the existing one unchanged.
    async fn create_or_get_stage(&self, job_id: ResourceId, spec: &StageSpec) -> DbResult<Stage>;

    async fn get_stage(&self, job_id: ResourceId, stage: &StageName) -> DbResult<Option<Stage>>;

    async fn list_stages(&self, job_id: ResourceId) -> DbResult<Vec<Stage>>;

    /// Lease a stage: pending (backoff elapsed) or expired-lease → leased,
    /// incrementing attempt_count. `None` if the stage is held by a live lease,
    /// backing off, terminal, or out of attempts.
    async fn start_stage(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        lease_duration: Duration,
    ) -> DbResult<Option<StageLease>>;

    /// leased → processing for the holder of `lease`.
    async fn begin_processing(&self, lease: &StageLease) -> DbResult<bool>;

    /// Heartbeat. False means the lease has been taken over.
    async fn extend_lease(&self, lease: &StageLease, lease_duration: Duration) -> DbResult<bool>;

    /// Write the payload, complete the stage, and either create the next stage
    /// row (moving `current_stage` to it) or mark the job completed.
    /// False if the lease was lost.
    async fn complete_stage(
        &self,
        lease: &StageLease,
        payload: serde_json::Value,
        next: Option<&StageSpec>,
    ) -> DbResult<bool>;

    /// Record a failed attempt.
    ///
    /// With `attempt = Some(n)` only the holder of attempt `n` may fail the
    /// stage. With `None` any non-terminal stage is failed (used for forced
    /// dead-lettering). Transient errors with attempts left reset the stage to
    /// pending with backoff; everything else dead-letters it and fails the job.
    async fn fail_stage(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        attempt: Option<u32>,
        error: &StageError,
        snapshot: serde_json::Value,
    ) -> DbResult<FailOutcome>;

    /// The job row and its stage rows.
    async fn job_status(&self, job_id: ResourceId) -> DbResult<JobStatusReport>;

    /// Append a payload outside a stage lease (intake).
    async fn put_payload(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        data: serde_json::Value,
    ) -> DbResult<Payload>;

    /// All payloads of a job, oldest first.
    async fn list_payloads(&self, job_id: ResourceId) -> DbResult<Vec<Payload>>;

    /// Newest payload per stage.
    async fn latest_payloads(&self, job_id: ResourceId) -> DbResult<PriorPayloads> {
        Ok(PriorPayloads::from_payloads(self.list_payloads(job_id).await?))
    }

    async fn append_event(&self, event: NewEvent) -> DbResult<Event>;

    /// All events of a job, oldest first.
    async fn list_events(&self, job_id: ResourceId) -> DbResult<Vec<Event>>;

    /// Dead letters, optionally for one stage, newest first.
    async fn list_dead_letters(
        &self,
        stage: Option<&StageName>,
        include_resolved: bool,
    ) -> DbResult<Vec<DeadLetter>>;

    /// Reset a dead-lettered stage to pending with attempt_count 0, resolve its
    /// dead letter and put the job back to processing.
    /// `Conflict` if the stage is not dead-lettered.
    async fn redrive_stage(&self, job_id: ResourceId, stage: &StageName) -> DbResult<Stage>;

    /// Row counts per stage name.
    async fn stage_counts(&self) -> DbResult<Vec<StageCounts>>;
}
