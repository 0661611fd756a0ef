//! In-memory pipeline store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contentflow_core::clock::to_chrono;
use contentflow_core::retry::grow_delay;
use contentflow_core::{
    Clock, DeadLetter, ErrorKind, Event, Job, JobStatus, NewEvent, NewJob, Payload, ResourceId,
    Stage, StageError, StageLease, StageName, StageSpec, StageStatus, SystemClock,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::store::{FailOutcome, JobStatusReport, PipelineStore, StageCounts};
use crate::{DbError, DbResult};

#[derive(Default)]
struct StoreState {
    jobs: HashMap<ResourceId, Job>,
    stages: BTreeMap<(ResourceId, StageName), Stage>,
    payloads: Vec<Payload>,
    events: Vec<Event>,
    dead_letters: Vec<DeadLetter>,
}

impl StoreState {
    fn job_mut(&mut self, job_id: ResourceId) -> DbResult<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))
    }

    fn stage_mut(&mut self, job_id: ResourceId, stage: &StageName) -> Option<&mut Stage> {
        self.stages.get_mut(&(job_id, stage.clone()))
    }

    fn push_event(&mut self, event: NewEvent, now: DateTime<Utc>) -> Event {
        let event = event.into_event(now);
        self.events.push(event.clone());
        event
    }

    fn resolve_dead_letters(
        &mut self,
        job_id: ResourceId,
        stage: Option<&StageName>,
        resolution: &str,
        now: DateTime<Utc>,
    ) {
        for dl in self.dead_letters.iter_mut() {
            if dl.job_id == job_id
                && !dl.is_resolved()
                && stage.is_none_or(|s| &dl.stage == s)
            {
                dl.resolved_at = Some(now);
                dl.resolution = Some(resolution.to_string());
            }
        }
    }

    /// Stage held by `lease`, if the lease still matches.
    fn held_stage(&mut self, lease: &StageLease) -> Option<&mut Stage> {
        self.stage_mut(lease.job_id, &lease.stage)
            .filter(|s| s.status.is_active() && s.attempt_count == lease.attempt)
    }
}

/// Pipeline store backed by process memory.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(StoreState::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn create_job(&self, job: NewJob) -> DbResult<Job> {
        let now = self.clock.now();
        let job = Job {
            id: ResourceId::new(),
            job_type: job.job_type,
            status: JobStatus::Queued,
            current_stage: None,
            max_attempts: job.max_attempts.max(1),
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        state.push_event(NewEvent::job(job.id, JobStatus::Queued, "job created"), now);
        Ok(job)
    }

    async fn get_job(&self, job_id: ResourceId) -> DbResult<Job> {
        let mut state = self.state.lock().await;
        Ok(state.job_mut(job_id)?.clone())
    }

    async fn cancel_job(&self, job_id: ResourceId, reason: &str) -> DbResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.updated_at = now;
        state.resolve_dead_letters(job_id, None, "job cancelled", now);
        state.push_event(NewEvent::job(job_id, JobStatus::Cancelled, reason), now);
        Ok(true)
    }

    async fn create_or_get_stage(&self, job_id: ResourceId, spec: &StageSpec) -> DbResult<Stage> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        if job.current_stage.is_none() {
            job.current_stage = Some(spec.name.clone());
            job.updated_at = now;
        }
        if let Some(existing) = state.stage_mut(job_id, &spec.name) {
            return Ok(existing.clone());
        }

        let stage = Stage::from_spec(job_id, spec, now);
        state
            .stages
            .insert((job_id, spec.name.clone()), stage.clone());
        state.push_event(
            NewEvent::stage(job_id, &spec.name, StageStatus::Pending, "stage created"),
            now,
        );
        Ok(stage)
    }

    async fn get_stage(&self, job_id: ResourceId, stage: &StageName) -> DbResult<Option<Stage>> {
        let state = self.state.lock().await;
        Ok(state.stages.get(&(job_id, stage.clone())).cloned())
    }

    async fn list_stages(&self, job_id: ResourceId) -> DbResult<Vec<Stage>> {
        let state = self.state.lock().await;
        let mut stages: Vec<Stage> = state
            .stages
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        stages.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        Ok(stages)
    }

    async fn start_stage(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        lease_duration: Duration,
    ) -> DbResult<Option<StageLease>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(row) = state.stage_mut(job_id, stage) else {
            return Ok(None);
        };
        if !row.can_start(now) {
            return Ok(None);
        }

        row.status = StageStatus::Leased;
        row.attempt_count += 1;
        row.lease_expires_at = Some(now + to_chrono(lease_duration));
        row.started_at.get_or_insert(now);
        row.updated_at = now;
        let lease = StageLease {
            job_id,
            stage: stage.clone(),
            attempt: row.attempt_count,
            expires_at: now + to_chrono(lease_duration),
        };

        state.push_event(
            NewEvent::stage(
                job_id,
                stage,
                StageStatus::Leased,
                format!("attempt {} leased", lease.attempt),
            )
            .with_metadata(json!({ "attempt": lease.attempt })),
            now,
        );
        Ok(Some(lease))
    }

    async fn begin_processing(&self, lease: &StageLease) -> DbResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(row) = state.held_stage(lease) else {
            return Ok(false);
        };
        if row.status != StageStatus::Leased || !row.has_live_lease(now) {
            return Ok(false);
        }
        row.status = StageStatus::Processing;
        row.updated_at = now;

        let job = state.job_mut(lease.job_id)?;
        if job.status == JobStatus::Queued {
            job.status = JobStatus::Processing;
        }
        job.current_stage = Some(lease.stage.clone());
        job.updated_at = now;

        state.push_event(
            NewEvent::stage(
                lease.job_id,
                &lease.stage,
                StageStatus::Processing,
                format!("attempt {} processing", lease.attempt),
            )
            .with_metadata(json!({ "attempt": lease.attempt })),
            now,
        );
        Ok(true)
    }

    async fn extend_lease(&self, lease: &StageLease, lease_duration: Duration) -> DbResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.held_stage(lease) {
            Some(row) => {
                row.lease_expires_at = Some(now + to_chrono(lease_duration));
                row.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_stage(
        &self,
        lease: &StageLease,
        payload: serde_json::Value,
        next: Option<&StageSpec>,
    ) -> DbResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(row) = state.held_stage(lease) else {
            return Ok(false);
        };
        row.status = StageStatus::Completed;
        row.lease_expires_at = None;
        row.last_error = None;
        row.finished_at = Some(now);
        row.updated_at = now;

        state.payloads.push(Payload {
            id: ResourceId::new(),
            job_id: lease.job_id,
            stage: lease.stage.clone(),
            attempt: lease.attempt,
            data: payload,
            created_at: now,
        });
        state.push_event(
            NewEvent::stage(
                lease.job_id,
                &lease.stage,
                StageStatus::Completed,
                "stage completed",
            )
            .with_metadata(json!({ "attempt": lease.attempt })),
            now,
        );

        let job = state.job_mut(lease.job_id)?;
        if job.status == JobStatus::Cancelled {
            return Ok(true);
        }
        job.updated_at = now;
        match next {
            Some(spec) => {
                job.status = JobStatus::Processing;
                job.current_stage = Some(spec.name.clone());
                let key = (lease.job_id, spec.name.clone());
                if !state.stages.contains_key(&key) {
                    state
                        .stages
                        .insert(key, Stage::from_spec(lease.job_id, spec, now));
                    state.push_event(
                        NewEvent::stage(
                            lease.job_id,
                            &spec.name,
                            StageStatus::Pending,
                            "stage created",
                        ),
                        now,
                    );
                }
            }
            None => {
                job.status = JobStatus::Completed;
                state.push_event(
                    NewEvent::job(lease.job_id, JobStatus::Completed, "job completed"),
                    now,
                );
            }
        }
        Ok(true)
    }

    async fn fail_stage(
        &self,
        job_id: ResourceId,
        stage: &StageName,
        attempt: Option<u32>,
        error: &StageError,
        snapshot: serde_json::Value,
    ) -> DbResult<FailOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(row) = state.stage_mut(job_id, stage) else {
            return Ok(FailOutcome::Stale);
        };
        let held = match attempt {
            Some(n) => row.status.is_active() && row.attempt_count == n,
            None => !row.status.is_terminal(),
        };
        if !held {
            return Ok(FailOutcome::Stale);
        }

        let attempt = row.attempt_count;
        let metadata = json!({
            "attempt": attempt,
            "error_kind": error.kind.as_str(),
            "error": error.message,
        });
        row.lease_expires_at = None;
        row.last_error = Some(error.to_string());
        row.updated_at = now;

        if error.kind.should_retry() && !row.attempts_exhausted() {
            let delay = row.retry_delay;
            row.status = StageStatus::Pending;
            row.available_at = now + to_chrono(delay);
            row.retry_delay = grow_delay(delay, row.backoff_factor, row.max_retry_delay);
            state.push_event(
                NewEvent::stage(
                    job_id,
                    stage,
                    StageStatus::Pending,
                    format!("attempt {} failed, retrying in {}ms", attempt, delay.as_millis()),
                )
                .with_metadata(metadata),
                now,
            );
            return Ok(FailOutcome::Retrying { attempt, delay });
        }

        row.status = StageStatus::DeadLettered;
        row.finished_at = Some(now);
        let cancelled = error.kind == ErrorKind::Cancelled;
        let dead_letter = DeadLetter {
            id: ResourceId::new(),
            job_id,
            stage: stage.clone(),
            snapshot,
            reason: error.to_string(),
            attempt_count: attempt,
            routed_at: now,
            resolved_at: cancelled.then_some(now),
            resolution: cancelled.then(|| "job cancelled".to_string()),
        };
        let dead_letter_id = dead_letter.id;
        state.dead_letters.push(dead_letter);
        state.push_event(
            NewEvent::stage(
                job_id,
                stage,
                StageStatus::DeadLettered,
                error.to_string(),
            )
            .with_metadata(metadata),
            now,
        );

        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Cancelled {
            job.status = JobStatus::Failed;
            job.current_stage = Some(stage.clone());
            job.updated_at = now;
            state.push_event(
                NewEvent::job(
                    job_id,
                    JobStatus::Failed,
                    format!("stage {} dead-lettered", stage),
                ),
                now,
            );
        }
        Ok(FailOutcome::DeadLettered { dead_letter_id })
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
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.job_mut(job_id)?;
        let payload = Payload {
            id: ResourceId::new(),
            job_id,
            stage: stage.clone(),
            attempt: 0,
            data,
            created_at: now,
        };
        state.payloads.push(payload.clone());
        Ok(payload)
    }

    async fn list_payloads(&self, job_id: ResourceId) -> DbResult<Vec<Payload>> {
        let state = self.state.lock().await;
        Ok(state
            .payloads
            .iter()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: NewEvent) -> DbResult<Event> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.job_mut(event.job_id)?;
        Ok(state.push_event(event, now))
    }

    async fn list_events(&self, job_id: ResourceId) -> DbResult<Vec<Event>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_dead_letters(
        &self,
        stage: Option<&StageName>,
        include_resolved: bool,
    ) -> DbResult<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        let mut dead_letters: Vec<DeadLetter> = state
            .dead_letters
            .iter()
            .filter(|dl| stage.is_none_or(|s| &dl.stage == s))
            .filter(|dl| include_resolved || !dl.is_resolved())
            .cloned()
            .collect();
        dead_letters.reverse();
        Ok(dead_letters)
    }

    async fn redrive_stage(&self, job_id: ResourceId, stage: &StageName) -> DbResult<Stage> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let row = state
            .stage_mut(job_id, stage)
            .ok_or_else(|| DbError::NotFound(format!("stage {} of job {}", stage, job_id)))?;
        if row.status != StageStatus::DeadLettered {
            return Err(DbError::Conflict(format!(
                "stage {} of job {} is {}, not dead_lettered",
                stage, job_id, row.status
            )));
        }

        let previous_attempts = row.attempt_count;
        row.status = StageStatus::Pending;
        row.attempt_count = 0;
        row.retry_delay = row.base_retry_delay;
        row.available_at = now;
        row.lease_expires_at = None;
        row.last_error = None;
        row.finished_at = None;
        row.updated_at = now;
        let redriven = row.clone();

        state.resolve_dead_letters(job_id, Some(stage), "redriven", now);
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Processing;
        job.current_stage = Some(stage.clone());
        job.updated_at = now;
        state.push_event(
            NewEvent::stage(
                job_id,
                stage,
                StageStatus::Pending,
                "stage redriven by operator",
            )
            .with_metadata(json!({ "previous_attempts": previous_attempts })),
            now,
        );
        Ok(redriven)
    }

    async fn stage_counts(&self) -> DbResult<Vec<StageCounts>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<StageName, StageCounts> = BTreeMap::new();
        for stage in state.stages.values() {
            let entry = counts
                .entry(stage.name.clone())
                .or_insert_with(|| StageCounts::empty(stage.name.clone()));
            match stage.status {
                StageStatus::Pending => entry.pending += 1,
                StageStatus::Leased | StageStatus::Processing => entry.active += 1,
                StageStatus::Completed => entry.completed += 1,
                StageStatus::Failed | StageStatus::DeadLettered => {}
            }
        }
        for dl in state.dead_letters.iter().filter(|dl| !dl.is_resolved()) {
            counts
                .entry(dl.stage.clone())
                .or_insert_with(|| StageCounts::empty(dl.stage.clone()))
                .dead_lettered += 1;
        }
        Ok(counts.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contentflow_core::{ManualClock, RetryPolicy};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Fixture { clock, store }
    }

    fn name(s: &str) -> StageName {
        StageName::new(s).unwrap()
    }

    fn spec(s: &str, max_attempts: u32) -> StageSpec {
        StageSpec::new(
            name(s),
            &RetryPolicy {
                max_attempts,
                retry_delay: Duration::from_secs(30),
                backoff_factor: 2.0,
                max_retry_delay: Duration::from_secs(3600),
            },
        )
    }

    const LEASE: Duration = Duration::from_secs(300);

    async fn job_with_stage(f: &Fixture, stage: &StageSpec) -> Job {
        let job = f.store.create_job(NewJob::new("article")).await.unwrap();
        f.store.create_or_get_stage(job.id, stage).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_create_or_get_stage_is_idempotent() {
        let f = fixture();
        let research = spec("research", 3);
        let job = job_with_stage(&f, &research).await;

        let lease = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        let again = f.store.create_or_get_stage(job.id, &research).await.unwrap();
        assert_eq!(again.status, StageStatus::Leased);
        assert_eq!(again.attempt_count, lease.attempt);
        assert_eq!(f.store.list_stages(job.id).await.unwrap().len(), 1);

        let job = f.store.get_job(job.id).await.unwrap();
        assert_eq!(job.current_stage, Some(research.name.clone()));
    }

    #[tokio::test]
    async fn test_create_stage_for_unknown_job() {
        let f = fixture();
        let err = f
            .store
            .create_or_get_stage(ResourceId::new(), &spec("research", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_at_most_one_concurrent_lease() {
        let f = fixture();
        let research = spec("research", 3);
        let job = job_with_stage(&f, &research).await;

        let attempts = (0..16).map(|_| {
            let store = f.store.clone();
            let stage = research.name.clone();
            async move { store.start_stage(job.id, &stage, LEASE).await.unwrap() }
        });
        let leases: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();

        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let f = fixture();
        let research = spec("research", 3);
        let job = job_with_stage(&f, &research).await;

        let first = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert!(f.store.begin_processing(&first).await.unwrap());

        // Worker crashes; nobody heartbeats.
        f.clock.advance(LEASE + Duration::from_secs(1));
        let second = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, 2);

        // The crashed worker's writes are fenced off.
        assert!(!f.store.extend_lease(&first, LEASE).await.unwrap());
        assert!(
            !f.store
                .complete_stage(&first, json!({"stale": true}), None)
                .await
                .unwrap()
        );
        let outcome = f
            .store
            .fail_stage(
                job.id,
                &research.name,
                Some(first.attempt),
                &StageError::transient("timeout"),
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);
        assert!(f.store.list_payloads(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_lease_blocks_start() {
        let f = fixture();
        let research = spec("research", 3);
        let job = job_with_stage(&f, &research).await;

        let lease = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        f.clock.advance(LEASE - Duration::from_secs(1));
        assert!(f.store.extend_lease(&lease, LEASE).await.unwrap());
        f.clock.advance(Duration::from_secs(2));
        assert!(
            f.store
                .start_stage(job.id, &research.name, LEASE)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_dead_letter() {
        let f = fixture();
        let research = spec("research", 3);
        let job = job_with_stage(&f, &research).await;
        let err = StageError::transient("rate limited");

        let mut delays = Vec::new();
        for expected_attempt in 1..=3 {
            let lease = f
                .store
                .start_stage(job.id, &research.name, LEASE)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(lease.attempt, expected_attempt);
            let outcome = f
                .store
                .fail_stage(
                    job.id,
                    &research.name,
                    Some(lease.attempt),
                    &err,
                    json!({"attempt": lease.attempt}),
                )
                .await
                .unwrap();
            match outcome {
                FailOutcome::Retrying { attempt, delay } => {
                    assert_eq!(attempt, expected_attempt);
                    // Still backing off.
                    assert!(
                        f.store
                            .start_stage(job.id, &research.name, LEASE)
                            .await
                            .unwrap()
                            .is_none()
                    );
                    delays.push(delay);
                    f.clock.advance(delay);
                }
                FailOutcome::DeadLettered { .. } => assert_eq!(expected_attempt, 3),
                FailOutcome::Stale => panic!("unexpected stale outcome"),
            }
        }
        assert_eq!(delays, vec![Duration::from_secs(30), Duration::from_secs(60)]);

        let report = f.store.job_status(job.id).await.unwrap();
        assert_eq!(report.status(), JobStatus::Failed);
        assert_eq!(report.derived_status(), JobStatus::Failed);
        let stage = report.stage(&research.name).unwrap();
        assert_eq!(stage.status, StageStatus::DeadLettered);
        assert_eq!(stage.attempt_count, 3);

        let dead_letters = f.store.list_dead_letters(None, false).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].attempt_count, 3);
        assert_eq!(dead_letters[0].snapshot, json!({"attempt": 3}));
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_immediately() {
        let f = fixture();
        let draft = spec("draft", 5);
        let job = job_with_stage(&f, &draft).await;
        let lease = f
            .store
            .start_stage(job.id, &draft.name, LEASE)
            .await
            .unwrap()
            .unwrap();

        let outcome = f
            .store
            .fail_stage(
                job.id,
                &draft.name,
                Some(lease.attempt),
                &StageError::permanent("outline missing"),
                json!({}),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered { .. }));
        assert_eq!(
            f.store.get_job(job.id).await.unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_complete_advances_to_next_stage() {
        let f = fixture();
        let research = spec("research", 3);
        let outline = spec("outline", 3);
        let job = job_with_stage(&f, &research).await;

        let lease = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert!(f.store.begin_processing(&lease).await.unwrap());
        assert_eq!(
            f.store.get_job(job.id).await.unwrap().status,
            JobStatus::Processing
        );
        assert!(
            f.store
                .complete_stage(&lease, json!({"sources": 3}), Some(&outline))
                .await
                .unwrap()
        );

        let report = f.store.job_status(job.id).await.unwrap();
        assert_eq!(report.job.current_stage, Some(outline.name.clone()));
        assert_eq!(report.status(), JobStatus::Processing);
        assert_eq!(
            report.stage(&research.name).unwrap().status,
            StageStatus::Completed
        );
        assert_eq!(
            report.stage(&outline.name).unwrap().status,
            StageStatus::Pending
        );

        let prior = f.store.latest_payloads(job.id).await.unwrap();
        assert_eq!(prior.get(&research.name), Some(&json!({"sources": 3})));

        // Completing twice is refused.
        assert!(
            !f.store
                .complete_stage(&lease, json!({}), Some(&outline))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_complete_final_stage_completes_job() {
        let f = fixture();
        let publish = spec("publish", 1);
        let job = job_with_stage(&f, &publish).await;
        let lease = f
            .store
            .start_stage(job.id, &publish.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert!(
            f.store
                .complete_stage(&lease, json!({"url": "/a"}), None)
                .await
                .unwrap()
        );

        let report = f.store.job_status(job.id).await.unwrap();
        assert_eq!(report.status(), JobStatus::Completed);
        assert_eq!(report.derived_status(), JobStatus::Completed);

        let statuses: Vec<String> = f
            .store
            .list_events(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            vec!["queued", "pending", "leased", "completed", "completed"]
        );
    }

    #[tokio::test]
    async fn test_redrive_resets_stage_and_resolves_dead_letter() {
        let f = fixture();
        let research = spec("research", 1);
        let job = job_with_stage(&f, &research).await;
        let lease = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        f.store
            .fail_stage(
                job.id,
                &research.name,
                Some(lease.attempt),
                &StageError::transient("timeout"),
                json!({}),
            )
            .await
            .unwrap();

        let stage = f.store.redrive_stage(job.id, &research.name).await.unwrap();
        assert_eq!(stage.status, StageStatus::Pending);
        assert_eq!(stage.attempt_count, 0);
        assert_eq!(
            f.store.get_job(job.id).await.unwrap().status,
            JobStatus::Processing
        );
        assert!(
            f.store
                .list_dead_letters(None, false)
                .await
                .unwrap()
                .is_empty()
        );
        let all = f.store.list_dead_letters(None, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].resolution.as_deref(), Some("redriven"));

        // Only dead-lettered stages can be redriven.
        let err = f
            .store
            .redrive_stage(job.id, &research.name)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        let lease = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.attempt, 1);
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let f = fixture();
        let research = spec("research", 3);
        let job = job_with_stage(&f, &research).await;
        let lease = f
            .store
            .start_stage(job.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();

        assert!(f.store.cancel_job(job.id, "operator request").await.unwrap());
        assert!(!f.store.cancel_job(job.id, "again").await.unwrap());

        let outcome = f
            .store
            .fail_stage(
                job.id,
                &research.name,
                Some(lease.attempt),
                &StageError::cancelled(),
                json!({}),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered { .. }));

        let report = f.store.job_status(job.id).await.unwrap();
        assert_eq!(report.status(), JobStatus::Cancelled);
        assert_eq!(report.derived_status(), JobStatus::Cancelled);
        assert!(
            f.store
                .list_dead_letters(None, false)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_forced_dead_letter_without_lease() {
        let f = fixture();
        let research = spec("research", 3);
        let job = job_with_stage(&f, &research).await;

        let outcome = f
            .store
            .fail_stage(
                job.id,
                &research.name,
                None,
                &StageError::permanent("delivery limit exceeded"),
                json!({}),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered { .. }));

        // Terminal now, so a second forced failure is stale.
        let outcome = f
            .store
            .fail_stage(
                job.id,
                &research.name,
                None,
                &StageError::permanent("delivery limit exceeded"),
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);
    }

    #[tokio::test]
    async fn test_stage_counts() {
        let f = fixture();
        let research = spec("research", 1);
        let a = job_with_stage(&f, &research).await;
        let _b = job_with_stage(&f, &research).await;

        let lease = f
            .store
            .start_stage(a.id, &research.name, LEASE)
            .await
            .unwrap()
            .unwrap();
        f.store
            .fail_stage(
                a.id,
                &research.name,
                Some(lease.attempt),
                &StageError::permanent("bad input"),
                json!({}),
            )
            .await
            .unwrap();

        let counts = f.store.stage_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![StageCounts {
                stage: research.name.clone(),
                pending: 1,
                active: 0,
                completed: 0,
                dead_lettered: 1,
            }]
        );
    }

    #[tokio::test]
    async fn test_intake_payload() {
        let f = fixture();
        let job = f.store.create_job(NewJob::new("article")).await.unwrap();
        f.store
            .put_payload(job.id, &StageName::intake(), json!({"topic": "rust"}))
            .await
            .unwrap();
        let prior = f.store.latest_payloads(job.id).await.unwrap();
        assert_eq!(
            prior.get(&StageName::intake()),
            Some(&json!({"topic": "rust"}))
        );

        let err = f
            .store
            .put_payload(ResourceId::new(), &StageName::intake(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }
}
