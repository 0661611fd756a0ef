//! Stage workers and dispatcher for contentflow pipelines.
//!
//! A [`Pipeline`] binds a validated [`contentflow_core::PipelineDefinition`] to a
//! [`Backend`] (queue + store). Jobs enter through [`Pipeline::submit`]; a
//! [`Dispatcher`] launches [`StageWorker`]s in proportion to each stage's
//! backlog, and workers advance stages through the lease protocol of the store.

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod telemetry;
pub mod worker;

pub use backend::Backend;
pub use dispatcher::{Dispatcher, StageTick, TickReport};
pub use error::{SchedulerError, SchedulerResult};
pub use pipeline::{JobReport, PayloadSummary, Pipeline, StageBacklog, SubmitJob};
pub use registry::HandlerRegistry;
pub use telemetry::init_tracing;
pub use worker::{StageWorker, WorkerOutcome};
