//! Dispatcher: polls stage backlogs and launches workers within each stage's
//! concurrency ceiling.

use contentflow_core::{PipelineDefinition, StageName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::worker::millis;
use crate::{Backend, HandlerRegistry, SchedulerResult, StageWorker, WorkerOutcome};

struct StageSlot {
    worker: Arc<StageWorker>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

/// What one dispatcher tick saw and did for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTick {
    pub stage: StageName,
    /// Visible messages at the time of the tick.
    pub backlog: u64,
    /// Workers running after the tick.
    pub in_flight: usize,
    /// Workers launched by this tick.
    pub launched: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub stages: Vec<StageTick>,
    /// Outcomes of workers that finished since the previous tick.
    pub finished: Vec<WorkerOutcome>,
}

impl TickReport {
    pub fn launched(&self, stage: &StageName) -> usize {
        self.stages
            .iter()
            .find(|s| &s.stage == stage)
            .map(|s| s.launched)
            .unwrap_or(0)
    }

    pub fn total_launched(&self) -> usize {
        self.stages.iter().map(|s| s.launched).sum()
    }
}

/// Launches stage workers in proportion to backlog, never above a stage's
/// `max_concurrency`.
pub struct Dispatcher {
    pipeline: Arc<PipelineDefinition>,
    slots: Vec<StageSlot>,
    tasks: JoinSet<Option<WorkerOutcome>>,
    worker_id: String,
}

impl Dispatcher {
    /// Build a dispatcher. Every stage of the pipeline needs a handler.
    pub fn new(
        pipeline: Arc<PipelineDefinition>,
        registry: &HandlerRegistry,
        backend: Backend,
    ) -> SchedulerResult<Self> {
        let slots = registry
            .resolve(&pipeline)?
            .into_iter()
            .map(|(stage, handler)| {
                let worker =
                    StageWorker::new(pipeline.clone(), &stage.name, handler, backend.clone())?;
                Ok(StageSlot {
                    worker: Arc::new(worker),
                    permits: Arc::new(Semaphore::new(stage.max_concurrency)),
                    max_concurrency: stage.max_concurrency,
                })
            })
            .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(Self {
            pipeline,
            slots,
            tasks: JoinSet::new(),
            worker_id: format!("worker-{}", std::process::id()),
        })
    }

    /// Name this process in the dispatcher's logs, usually `RuntimeConfig::worker_id`.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    /// Workers currently running for `stage`.
    pub fn in_flight(&self, stage: &StageName) -> usize {
        self.slots
            .iter()
            .find(|slot| &slot.worker.stage().name == stage)
            .map(|slot| slot.max_concurrency - slot.permits.available_permits())
            .unwrap_or(0)
    }

    /// Workers running across all stages.
    pub fn total_in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Reap finished workers, then launch `min(free slots, backlog)` workers per
    /// stage, earlier stages first.
    pub async fn tick(&mut self) -> SchedulerResult<TickReport> {
        let mut report = TickReport {
            finished: self.reap(),
            ..Default::default()
        };

        for slot in &self.slots {
            let stage = &slot.worker.stage().name;
            let backlog = slot.worker.backlog_depth().await?;
            let free = slot.permits.available_permits();
            let wanted = usize::try_from(backlog).unwrap_or(usize::MAX).min(free);

            let mut launched = 0;
            for _ in 0..wanted {
                let Ok(permit) = slot.permits.clone().try_acquire_owned() else {
                    break;
                };
                let worker = slot.worker.clone();
                self.tasks.spawn(
                    async move {
                        let _permit = permit;
                        match worker.run_once().await {
                            Ok(outcome) => Some(outcome),
                            Err(e) => {
                                error!(stage = %worker.stage().name, error = %e, "Stage worker failed");
                                None
                            }
                        }
                    }
                    .in_current_span(),
                );
                launched += 1;
            }

            if launched > 0 {
                debug!(%stage, backlog, launched, "Launched stage workers");
            }
            report.stages.push(StageTick {
                stage: stage.clone(),
                backlog,
                in_flight: slot.max_concurrency - slot.permits.available_permits(),
                launched,
            });
        }

        Ok(report)
    }

    /// Outcomes of workers that have already finished.
    fn reap(&mut self) -> Vec<WorkerOutcome> {
        let mut finished = Vec::new();
        while let Some(joined) = self.tasks.try_join_next() {
            collect(joined, &mut finished);
        }
        finished
    }

    /// Wait for every running worker and return their outcomes.
    pub async fn drain(&mut self) -> Vec<WorkerOutcome> {
        let mut finished = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            collect(joined, &mut finished);
        }
        finished
    }

    /// Tick every `poll_interval` until `shutdown` fires, then wait for running
    /// workers to finish.
    pub async fn run(self, shutdown: CancellationToken) -> SchedulerResult<()> {
        let span = info_span!("dispatcher", worker_id = %self.worker_id);
        self.run_until(shutdown).instrument(span).await
    }

    async fn run_until(mut self, shutdown: CancellationToken) -> SchedulerResult<()> {
        info!(
            pipeline = %self.pipeline.name,
            stages = self.slots.len(),
            poll_interval_ms = millis(self.pipeline.poll_interval),
            "Dispatcher started"
        );

        loop {
            match self.tick().await {
                Ok(report) if report.total_launched() > 0 => {
                    debug!(launched = report.total_launched(), "Dispatcher tick");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Dispatcher tick failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.pipeline.poll_interval) => {}
            }
        }

        info!(running = self.tasks.len(), "Shutting down, waiting for workers");
        let finished = self.drain().await;
        info!(finished = finished.len(), "Dispatcher stopped");
        Ok(())
    }
}

fn collect(
    joined: Result<Option<WorkerOutcome>, tokio::task::JoinError>,
    finished: &mut Vec<WorkerOutcome>,
) {
    match joined {
        Ok(Some(outcome)) => finished.push(outcome),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Stage worker task panicked"),
    }
}
