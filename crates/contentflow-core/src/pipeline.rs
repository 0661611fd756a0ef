//! Pipeline and stage definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result, RetryPolicy, StageName, StageSpec};

/// A content pipeline: an ordered list of stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "article").
    pub name: String,
    /// How long the dispatcher sleeps between ticks.
    pub poll_interval: Duration,
    /// Deliveries after which a message is dead-lettered instead of redelivered.
    pub max_deliveries: u32,
    /// Stages in execution order. Earlier stages are dispatched first.
    pub stages: Vec<StageDefinition>,
}

/// A stage in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: StageName,
    /// Ceiling on concurrently running workers for this stage.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// How long a dequeued message and a stage lease last without a heartbeat.
    pub visibility_timeout: Duration,
    /// How often a running worker refreshes its lease.
    pub heartbeat_interval: Duration,
}

impl StageDefinition {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 1;
    pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(name: StageName) -> Self {
        Self {
            name,
            max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            visibility_timeout: Self::DEFAULT_VISIBILITY_TIMEOUT,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Row parameters for this stage, capped by the job's attempt budget.
    pub fn spec_for_job(&self, job_max_attempts: u32) -> StageSpec {
        let max = self.retry.max_attempts.min(job_max_attempts);
        StageSpec::new(self.name.clone(), &self.retry).with_max_attempts(max)
    }
}

impl PipelineDefinition {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_MAX_DELIVERIES: u32 = 10;

    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Result<Self> {
        let pipeline = Self {
            name: name.into(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_deliveries: Self::DEFAULT_MAX_DELIVERIES,
            stages,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Check the invariants every pipeline must hold.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidInput("pipeline name is empty".to_string()));
        }
        if self.stages.is_empty() {
            return Err(Error::InvalidInput(format!(
                "pipeline '{}' has no stages",
                self.name
            )));
        }
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.name.is_intake() {
                return Err(Error::InvalidInput(format!(
                    "stage name '{}' is reserved",
                    StageName::INTAKE
                )));
            }
            if self.stages[..idx].iter().any(|s| s.name == stage.name) {
                return Err(Error::InvalidInput(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }
            if stage.max_concurrency == 0 {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' needs max_concurrency >= 1",
                    stage.name
                )));
            }
            if stage.retry.max_attempts == 0 {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' needs max_attempts >= 1",
                    stage.name
                )));
            }
            let factor = stage.retry.backoff_factor;
            if factor.is_nan() || factor < 1.0 {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' needs backoff_factor >= 1.0",
                    stage.name
                )));
            }
            if stage.heartbeat_interval.is_zero() {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' needs a positive heartbeat interval",
                    stage.name
                )));
            }
            if stage.heartbeat_interval >= stage.visibility_timeout {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' heartbeat interval must be shorter than its visibility timeout",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    pub fn first_stage(&self) -> Option<&StageDefinition> {
        self.stages.first()
    }

    pub fn stage(&self, name: &StageName) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| &s.name == name)
    }

    pub fn position(&self, name: &StageName) -> Option<usize> {
        self.stages.iter().position(|s| &s.name == name)
    }

    /// The stage after `name`, or `None` if `name` is last or unknown.
    pub fn next_stage(&self, name: &StageName) -> Option<&StageDefinition> {
        self.position(name).and_then(|idx| self.stages.get(idx + 1))
    }

    /// The stage before `name`, or `None` if `name` is first or unknown.
    pub fn previous_stage(&self, name: &StageName) -> Option<&StageDefinition> {
        match self.position(name) {
            Some(idx) if idx > 0 => self.stages.get(idx - 1),
            _ => None,
        }
    }
}
