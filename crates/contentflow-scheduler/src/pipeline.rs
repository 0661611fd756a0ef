//! `Pipeline`: intake, monitoring and operator actions for one pipeline definition.

use chrono::{DateTime, Utc};
use contentflow_config::{ConfigError, load_pipeline};
use contentflow_core::{
    Event, Job, JobStatus, MessageBody, NewJob, PipelineDefinition, ResourceId, Stage, StageName,
};
use contentflow_db::StageCounts;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::{Backend, Dispatcher, HandlerRegistry, SchedulerError, SchedulerResult, StageWorker};

/// A request to start a job at the first stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub job_type: String,
    /// Per-stage attempt ceiling for this job. Defaults to the largest stage budget.
    pub max_attempts: Option<u32>,
    /// Stored as the `intake` payload for the first stage to read.
    pub initial_payload: Option<serde_json::Value>,
}

impl SubmitJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            max_attempts: None,
            initial_payload: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.initial_payload = Some(payload);
        self
    }
}

/// Queue depth and row counts for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBacklog {
    pub stage: StageName,
    pub ready: u64,
    pub in_flight: u64,
    pub delayed: u64,
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadSummary {
    pub stage: StageName,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    /// Top-level keys when the payload is an object.
    pub keys: Vec<String>,
}

/// Everything known about one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: Job,
    pub stages: Vec<Stage>,
    pub events: Vec<Event>,
    pub payloads: Vec<PayloadSummary>,
    /// Status implied by the stage rows.
    pub derived_status: JobStatus,
}

/// A validated pipeline bound to a backend.
#[derive(Clone)]
pub struct Pipeline {
    definition: Arc<PipelineDefinition>,
    backend: Backend,
}

impl Pipeline {
    pub fn new(definition: PipelineDefinition, backend: Backend) -> SchedulerResult<Self> {
        definition.validate().map_err(ConfigError::from)?;
        Ok(Self {
            definition: Arc::new(definition),
            backend,
        })
    }

    /// Load a KDL pipeline file.
    pub fn from_file(path: impl AsRef<Path>, backend: Backend) -> SchedulerResult<Self> {
        Self::new(load_pipeline(path)?, backend)
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn dispatcher(&self, registry: &HandlerRegistry) -> SchedulerResult<Dispatcher> {
        Dispatcher::new(self.definition.clone(), registry, self.backend.clone())
    }

    /// A standalone worker for one stage.
    pub fn worker(
        &self,
        stage: &StageName,
        registry: &HandlerRegistry,
    ) -> SchedulerResult<StageWorker> {
        let handler = registry
            .get(stage)
            .ok_or_else(|| SchedulerError::MissingHandler(stage.clone()))?;
        StageWorker::new(self.definition.clone(), stage, handler, self.backend.clone())
    }

    fn require_stage(&self, stage: &StageName) -> SchedulerResult<()> {
        match self.definition.stage(stage) {
            Some(_) => Ok(()),
            None => Err(SchedulerError::UnknownStage(stage.clone())),
        }
    }

    /// Create a job and enqueue its first stage.
    pub async fn submit(&self, request: SubmitJob) -> SchedulerResult<Job> {
        let first = self
            .definition
            .first_stage()
            .ok_or_else(|| ConfigError::MissingField("stages".to_string()))?;
        let max_attempts = request.max_attempts.unwrap_or_else(|| {
            self.definition
                .stages
                .iter()
                .map(|s| s.retry.max_attempts)
                .max()
                .unwrap_or(1)
        });

        let store = &self.backend.store;
        let job = store
            .create_job(NewJob::new(request.job_type).with_max_attempts(max_attempts))
            .await?;
        if let Some(data) = request.initial_payload {
            store.put_payload(job.id, &StageName::intake(), data).await?;
        }
        store
            .create_or_get_stage(job.id, &first.spec_for_job(job.max_attempts))
            .await?;
        self.backend
            .queue
            .enqueue(&first.name, &MessageBody::new(job.id, first.name.clone()))
            .await?;

        info!(job_id = %job.id, job_type = %job.job_type, stage = %first.name, "Job submitted");
        Ok(job)
    }

    /// Queue and store counts for every stage, in pipeline order.
    pub async fn backlog(&self) -> SchedulerResult<Vec<StageBacklog>> {
        let counts = self.backend.store.stage_counts().await?;
        let stats = try_join_all(
            self.definition
                .stages
                .iter()
                .map(|stage| self.backend.queue.stats(&stage.name)),
        )
        .await?;

        let mut backlog = Vec::with_capacity(self.definition.stages.len());
        for (stage, stats) in self.definition.stages.iter().zip(stats) {
            let rows = counts
                .iter()
                .find(|c| c.stage == stage.name)
                .cloned()
                .unwrap_or_else(|| StageCounts::empty(stage.name.clone()));
            backlog.push(StageBacklog {
                stage: stage.name.clone(),
                ready: stats.ready,
                in_flight: stats.in_flight,
                delayed: stats.delayed,
                pending: rows.pending,
                active: rows.active,
                completed: rows.completed,
                dead_lettered: rows.dead_lettered,
            });
        }
        Ok(backlog)
    }

    pub async fn job_report(&self, job_id: ResourceId) -> SchedulerResult<JobReport> {
        let store = &self.backend.store;
        let status = store.job_status(job_id).await?;
        let events = store.list_events(job_id).await?;
        let payloads = store
            .list_payloads(job_id)
            .await?
            .into_iter()
            .map(|p| PayloadSummary {
                keys: p
                    .data
                    .as_object()
                    .map(|obj| obj.keys().cloned().collect())
                    .unwrap_or_default(),
                stage: p.stage,
                attempt: p.attempt,
                created_at: p.created_at,
            })
            .collect();

        let derived_status = status.derived_status();
        Ok(JobReport {
            job: status.job,
            stages: status.stages,
            events,
            payloads,
            derived_status,
        })
    }

    /// Reset a dead-lettered stage and enqueue it again.
    ///
    /// `Conflict` if the stage is not dead-lettered; nothing is enqueued then.
    pub async fn redrive(&self, job_id: ResourceId, stage: &StageName) -> SchedulerResult<Stage> {
        self.require_stage(stage)?;
        let row = self
            .backend
            .store
            .redrive_stage(job_id, stage)
            .await
            .map_err(SchedulerError::from_db)?;
        self.backend
            .queue
            .enqueue(stage, &MessageBody::new(job_id, stage.clone()))
            .await?;
        info!(%job_id, %stage, "Stage redriven");
        Ok(row)
    }

    /// Cancel a job. Returns false if it had already completed or been cancelled.
    pub async fn cancel(&self, job_id: ResourceId, reason: &str) -> SchedulerResult<bool> {
        let cancelled = self.backend.store.cancel_job(job_id, reason).await?;
        if cancelled {
            info!(%job_id, reason, "Job cancelled");
        }
        Ok(cancelled)
    }
}
