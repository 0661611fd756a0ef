//! Stage worker harness.
//!
//! A `StageWorker` is bound to one stage. Each `run_once` call handles at most
//! one queue message end to end:
//!
//! ```text
//! dequeue ─► delivery ceiling ─► start_stage ─► begin_processing ─► cancelled?
//!         ─► prior payloads ─► handler (+ heartbeat) ─► complete_stage ─► enqueue next ─► ack
//!                                                   └► fail_stage ─► reschedule | ack
//! ```
//!
//! Every store write after `start_stage` is fenced by the leased attempt, so a
//! worker that lost its lease can never advance the stage.

use chrono::{DateTime, Utc};
use contentflow_core::{
    Clock, ErrorKind, Job, JobStatus, MessageBody, NewEvent, PipelineDefinition, PriorPayloads,
    QueueMessage, ResourceId, StageContext, StageDefinition, StageError, StageHandler,
    StageLease, StageName, StageStatus, StopSignal,
};
use contentflow_db::{DbError, DurableQueue, FailOutcome, PipelineStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{Backend, SchedulerError, SchedulerResult};

/// What one `run_once` call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerOutcome {
    /// The queue had no visible message.
    Idle,
    /// The stage completed; `next` is the stage enqueued after it, if any.
    Completed {
        job_id: ResourceId,
        next: Option<StageName>,
    },
    /// The attempt failed and will be retried after `delay`.
    Retrying {
        job_id: ResourceId,
        attempt: u32,
        delay: Duration,
    },
    /// The stage was dead-lettered.
    DeadLettered { job_id: ResourceId, reason: String },
    /// The job is cancelled; the stage was closed out.
    Cancelled { job_id: ResourceId },
    /// The stage was already terminal; the message was acked.
    Duplicate { job_id: ResourceId },
    /// Another worker holds the stage or it is backing off. Nothing changed.
    Busy { job_id: ResourceId },
    /// The lease was taken over while this worker held it; its result was dropped.
    LeaseLost { job_id: ResourceId },
    /// The message referred to a job or stage that no longer exists.
    Discarded { job_id: ResourceId },
}

/// What the heartbeat task saw while the handler ran.
#[derive(Debug, Clone, Copy, Default)]
struct HeartbeatReport {
    lease_lost: bool,
    job_cancelled: bool,
}

/// Runs one stage's handler against queue messages.
pub struct StageWorker {
    pipeline: Arc<PipelineDefinition>,
    stage: StageDefinition,
    handler: Arc<dyn StageHandler>,
    backend: Backend,
}

impl StageWorker {
    pub fn new(
        pipeline: Arc<PipelineDefinition>,
        stage: &StageName,
        handler: Arc<dyn StageHandler>,
        backend: Backend,
    ) -> SchedulerResult<Self> {
        let stage = pipeline
            .stage(stage)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownStage(stage.clone()))?;
        Ok(Self {
            pipeline,
            stage,
            handler,
            backend,
        })
    }

    pub fn stage(&self) -> &StageDefinition {
        &self.stage
    }

    /// Visible messages waiting in this stage's queue.
    pub async fn backlog_depth(&self) -> SchedulerResult<u64> {
        Ok(self.queue().backlog_depth(&self.stage.name).await?)
    }

    fn queue(&self) -> &dyn DurableQueue {
        self.backend.queue.as_ref()
    }

    fn store(&self) -> &dyn PipelineStore {
        self.backend.store.as_ref()
    }

    /// Handle at most one message from this stage's queue.
    pub async fn run_once(&self) -> SchedulerResult<WorkerOutcome> {
        let mut messages = self
            .queue()
            .dequeue(&self.stage.name, self.stage.visibility_timeout, 1)
            .await?;
        let Some(message) = messages.pop() else {
            debug!(stage = %self.stage.name, "no visible messages");
            return Ok(WorkerOutcome::Idle);
        };

        let span = info_span!(
            "stage_worker",
            stage = %self.stage.name,
            job_id = %message.body.job_id,
            message_id = %message.id,
            delivery = message.delivery_count,
        );
        self.process(message).instrument(span).await
    }

    async fn process(&self, message: QueueMessage) -> SchedulerResult<WorkerOutcome> {
        let job_id = message.body.job_id;
        let name = &self.stage.name;

        let job = match self.store().get_job(job_id).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => {
                warn!("job no longer exists, dropping message");
                self.queue().ack(message.id).await?;
                return Ok(WorkerOutcome::Discarded { job_id });
            }
            Err(e) => return Err(e.into()),
        };

        if job.status == JobStatus::Cancelled {
            return self.close_cancelled(&message, None).await;
        }

        if message.delivery_count > self.pipeline.max_deliveries {
            return self.enforce_delivery_limit(&job, &message).await;
        }

        let Some(lease) = self
            .store()
            .start_stage(job_id, name, self.stage.visibility_timeout)
            .await?
        else {
            return self.handle_unavailable(&job, &message).await;
        };
        debug!(attempt = lease.attempt, "stage leased");

        if !self.store().begin_processing(&lease).await? {
            warn!(attempt = lease.attempt, "lease expired before processing began");
            return self.lease_lost(&lease, "lease expired before processing began").await;
        }

        // Cancellation may have landed between the first read and the lease.
        let job = self.store().get_job(job_id).await?;
        if job.status == JobStatus::Cancelled {
            return self.close_cancelled(&message, Some(lease.attempt)).await;
        }

        let prior = self.store().latest_payloads(job_id).await?;
        if let Some(previous) = self.pipeline.previous_stage(name) {
            if !prior.contains(&previous.name) {
                let err = StageError::permanent(format!(
                    "missing output of stage '{}'",
                    previous.name
                ));
                return self.record_failure(&message, &lease, err, &prior).await;
            }
        }

        info!(attempt = lease.attempt, "running stage handler");
        let (result, heartbeat) = self.run_handler(&job, &lease, &message, prior.clone()).await;

        if heartbeat.lease_lost {
            warn!(attempt = lease.attempt, "lease lost while handler ran, result discarded");
            return self.lease_lost(&lease, "lease lost while handler ran").await;
        }
        if heartbeat.job_cancelled {
            return self.close_cancelled(&message, Some(lease.attempt)).await;
        }

        match result {
            Ok(payload) => self.record_success(&job, &message, &lease, payload).await,
            Err(err) if err.kind == ErrorKind::Cancelled => {
                self.close_cancelled(&message, Some(lease.attempt)).await
            }
            Err(err) => self.record_failure(&message, &lease, err, &prior).await,
        }
    }

    /// Run the handler while a background task keeps the lease and the message alive.
    async fn run_handler(
        &self,
        job: &Job,
        lease: &StageLease,
        message: &QueueMessage,
        prior: PriorPayloads,
    ) -> (Result<serde_json::Value, StageError>, HeartbeatReport) {
        let stop = StopSignal::new();
        let ctx = StageContext {
            job: job.clone(),
            stage: self.stage.name.clone(),
            attempt: lease.attempt,
            prior,
            stop: stop.clone(),
        };

        // Dropping the guard stops the heartbeat, including when the handler
        // panics or this future is dropped mid-run.
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        let heartbeat = tokio::spawn(
            heartbeat_loop(
                self.backend.clone(),
                lease.clone(),
                message.id,
                self.stage.heartbeat_interval,
                self.stage.visibility_timeout,
                stop,
                done.clone(),
            )
            .in_current_span(),
        );

        let result = self.handler.run(ctx).await;

        drop(guard);
        let report = match heartbeat.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "heartbeat task failed");
                HeartbeatReport::default()
            }
        };
        (result, report)
    }

    async fn record_success(
        &self,
        job: &Job,
        message: &QueueMessage,
        lease: &StageLease,
        payload: serde_json::Value,
    ) -> SchedulerResult<WorkerOutcome> {
        let job_id = job.id;
        let next = self
            .pipeline
            .next_stage(&self.stage.name)
            .map(|stage| stage.spec_for_job(job.max_attempts));

        if !self
            .store()
            .complete_stage(lease, payload, next.as_ref())
            .await?
        {
            warn!(attempt = lease.attempt, "lease lost before completion, result discarded");
            return self.lease_lost(lease, "lease lost before completion").await;
        }

        // Only enqueue once the completion is committed.
        if let Some(next) = &next {
            self.queue()
                .enqueue(&next.name, &MessageBody::new(job_id, next.name.clone()))
                .await?;
        }
        self.queue().ack(message.id).await?;

        match &next {
            Some(next) => info!(attempt = lease.attempt, next = %next.name, "stage completed"),
            None => info!(attempt = lease.attempt, "final stage completed, job done"),
        }
        Ok(WorkerOutcome::Completed {
            job_id,
            next: next.map(|spec| spec.name),
        })
    }

    async fn record_failure(
        &self,
        message: &QueueMessage,
        lease: &StageLease,
        err: StageError,
        prior: &PriorPayloads,
    ) -> SchedulerResult<WorkerOutcome> {
        let job_id = lease.job_id;
        let outcome = self
            .store()
            .fail_stage(
                job_id,
                &self.stage.name,
                Some(lease.attempt),
                &err,
                snapshot(message, prior),
            )
            .await?;

        match outcome {
            FailOutcome::Retrying { attempt, delay } => {
                warn!(
                    attempt,
                    delay_ms = millis(delay),
                    error = %err,
                    "stage attempt failed, retrying"
                );
                self.queue().reschedule(message.id, delay).await?;
                Ok(WorkerOutcome::Retrying {
                    job_id,
                    attempt,
                    delay,
                })
            }
            FailOutcome::DeadLettered { dead_letter_id } => {
                error!(
                    attempt = lease.attempt,
                    %dead_letter_id,
                    error = %err,
                    "stage dead-lettered"
                );
                self.queue().ack(message.id).await?;
                Ok(WorkerOutcome::DeadLettered {
                    job_id,
                    reason: err.to_string(),
                })
            }
            FailOutcome::Stale => {
                warn!(attempt = lease.attempt, "lease lost before failure was recorded");
                self.lease_lost(lease, &format!("lease lost before recording: {err}"))
                    .await
            }
        }
    }

    /// Note in the job's event log that this attempt's result was thrown away.
    async fn lease_lost(
        &self,
        lease: &StageLease,
        what: &str,
    ) -> SchedulerResult<WorkerOutcome> {
        let event = NewEvent {
            job_id: lease.job_id,
            stage: Some(self.stage.name.clone()),
            status: "lease_lost".to_string(),
            message: what.to_string(),
            metadata: json!({ "attempt": lease.attempt }),
        };
        if let Err(e) = self.store().append_event(event).await {
            warn!(error = %e, "failed to record lost lease");
        }
        Ok(WorkerOutcome::LeaseLost {
            job_id: lease.job_id,
        })
    }

    /// Dead-letter a stage this worker does not hold a lease on.
    async fn force_dead_letter(
        &self,
        message: &QueueMessage,
        err: StageError,
    ) -> SchedulerResult<WorkerOutcome> {
        let job_id = message.body.job_id;
        let prior = self.store().latest_payloads(job_id).await?;
        let outcome = self
            .store()
            .fail_stage(job_id, &self.stage.name, None, &err, snapshot(message, &prior))
            .await?;
        self.queue().ack(message.id).await?;

        match outcome {
            FailOutcome::DeadLettered { dead_letter_id } => {
                error!(%dead_letter_id, error = %err, "stage dead-lettered without a lease");
                Ok(WorkerOutcome::DeadLettered {
                    job_id,
                    reason: err.to_string(),
                })
            }
            // Already terminal: this delivery was a duplicate.
            FailOutcome::Stale | FailOutcome::Retrying { .. } => {
                Ok(WorkerOutcome::Duplicate { job_id })
            }
        }
    }

    /// A message past the delivery ceiling dead-letters its stage, unless the
    /// stage is already settled or another worker holds a live lease on it.
    async fn enforce_delivery_limit(
        &self,
        job: &Job,
        message: &QueueMessage,
    ) -> SchedulerResult<WorkerOutcome> {
        let now = self.backend.clock.now();
        let stage = self.store().get_stage(job.id, &self.stage.name).await?;
        if stage.is_some_and(|s| s.status.is_terminal() || s.has_live_lease(now)) {
            debug!("delivery limit reached for a settled or held stage");
            return self.handle_unavailable(job, message).await;
        }

        let err = StageError::permanent(format!(
            "delivery limit of {} exceeded",
            self.pipeline.max_deliveries
        ));
        self.force_dead_letter(message, err).await
    }

    /// Put the message back until `until`; the stage is not ours to work on yet.
    async fn defer(
        &self,
        message: &QueueMessage,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<WorkerOutcome> {
        let wait = (until - now).to_std().unwrap_or(Duration::ZERO);
        self.queue().reschedule(message.id, wait).await?;
        debug!(wait_ms = millis(wait), "stage unavailable, message deferred");
        Ok(WorkerOutcome::Busy {
            job_id: message.body.job_id,
        })
    }

    /// Close out a stage of a cancelled job and drop its message.
    async fn close_cancelled(
        &self,
        message: &QueueMessage,
        attempt: Option<u32>,
    ) -> SchedulerResult<WorkerOutcome> {
        let job_id = message.body.job_id;
        let outcome = self
            .store()
            .fail_stage(
                job_id,
                &self.stage.name,
                attempt,
                &StageError::cancelled(),
                snapshot(message, &PriorPayloads::default()),
            )
            .await?;
        if outcome == FailOutcome::Stale && attempt.is_some() {
            warn!("lease lost while closing out a cancelled job");
        }
        self.queue().ack(message.id).await?;
        info!("job cancelled, stage closed");
        Ok(WorkerOutcome::Cancelled { job_id })
    }

    /// `start_stage` refused: work out why from the stage row.
    async fn handle_unavailable(
        &self,
        job: &Job,
        message: &QueueMessage,
    ) -> SchedulerResult<WorkerOutcome> {
        let job_id = job.id;
        let now = self.backend.clock.now();
        let Some(stage) = self.store().get_stage(job_id, &self.stage.name).await? else {
            warn!("stage row missing, dropping message");
            self.queue().ack(message.id).await?;
            return Ok(WorkerOutcome::Discarded { job_id });
        };

        match stage.status {
            StageStatus::Completed => {
                self.repair_successor(job).await?;
                self.queue().ack(message.id).await?;
                debug!("duplicate delivery for completed stage");
                Ok(WorkerOutcome::Duplicate { job_id })
            }
            StageStatus::DeadLettered => {
                self.queue().ack(message.id).await?;
                debug!("duplicate delivery for dead-lettered stage");
                Ok(WorkerOutcome::Duplicate { job_id })
            }
            _ if stage.attempts_exhausted() && !stage.has_live_lease(now) => {
                let err = StageError::permanent(format!(
                    "attempt budget of {} exhausted",
                    stage.max_attempts
                ));
                self.force_dead_letter(message, err).await
            }
            // Backing off: come back when the stage is available again.
            StageStatus::Pending if stage.available_at > now => {
                self.defer(message, stage.available_at, now).await
            }
            // Held by another worker: come back when its lease would lapse, so a
            // crash of the holder is still noticed.
            _ => match stage.lease_expires_at {
                Some(held_until) if stage.has_live_lease(now) => {
                    debug!(status = %stage.status, "stage held by another worker");
                    self.defer(message, held_until, now).await
                }
                _ => Ok(WorkerOutcome::Busy { job_id }),
            },
        }
    }

    /// Re-enqueue the successor of a completed stage if it never got a message.
    ///
    /// A crash between `complete_stage` committing and the enqueue leaves the
    /// successor pending with no message; a duplicate delivery of this stage is
    /// the chance to repair that. A successor that still has a message queued
    /// is left alone.
    async fn repair_successor(&self, job: &Job) -> SchedulerResult<()> {
        let Some(next) = self.pipeline.next_stage(&self.stage.name) else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        let needs_message = match self.store().get_stage(job.id, &next.name).await? {
            Some(stage) => stage.status == StageStatus::Pending && stage.attempt_count == 0,
            None => {
                self.store()
                    .create_or_get_stage(job.id, &next.spec_for_job(job.max_attempts))
                    .await?;
                true
            }
        };
        if needs_message && !self.queue().has_message(&next.name, job.id).await? {
            info!(next = %next.name, "re-enqueueing successor stage");
            self.queue()
                .enqueue(&next.name, &MessageBody::new(job.id, next.name.clone()))
                .await?;
        }
        Ok(())
    }
}

/// Milliseconds for log fields, saturating.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The last message body and which payloads existed, kept with a dead letter.
fn snapshot(message: &QueueMessage, prior: &PriorPayloads) -> serde_json::Value {
    let payload_stages: Vec<&str> = prior.stages().map(StageName::as_str).collect();
    json!({
        "message_id": message.id,
        "body": message.body,
        "delivery_count": message.delivery_count,
        "payload_stages": payload_stages,
    })
}

async fn heartbeat_loop(
    backend: Backend,
    lease: StageLease,
    message_id: ResourceId,
    every: Duration,
    timeout: Duration,
    stop: StopSignal,
    done: CancellationToken,
) -> HeartbeatReport {
    let mut report = HeartbeatReport::default();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = done.cancelled() => return report,
            _ = interval.tick() => {
                match backend.store.extend_lease(&lease, timeout).await {
                    Ok(true) => debug!(attempt = lease.attempt, "lease extended"),
                    Ok(false) => {
                        report.lease_lost = true;
                        stop.stop();
                        return report;
                    }
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                }
                if let Err(e) = backend.queue.extend_visibility(message_id, timeout).await {
                    warn!(error = %e, "failed to extend message visibility");
                }
                match backend.store.get_job(lease.job_id).await {
                    Ok(job) if job.status == JobStatus::Cancelled => {
                        report.job_cancelled = true;
                        stop.stop();
                        return report;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "failed to check job status"),
                }
            }
        }
    }
}
