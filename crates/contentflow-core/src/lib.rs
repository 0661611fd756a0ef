//! Core domain types and traits for the contentflow pipeline.
//!
//! This crate contains:
//! - Resource identifiers and stage names
//! - Job, stage, payload, event and dead-letter records
//! - Queue message types
//! - Pipeline definitions and retry policy
//! - The `StageHandler` trait implemented by stage business logic
//! - Clocks used by the lease protocol

pub mod clock;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod handler;
pub mod id;
pub mod job;
pub mod message;
pub mod payload;
pub mod pipeline;
pub mod retry;
pub mod stage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::DeadLetter;
pub use error::{Error, Result};
pub use event::{Event, NewEvent};
pub use handler::{ErrorKind, StageContext, StageError, StageHandler, StopSignal};
pub use id::{ResourceId, StageName};
pub use job::{Job, JobStatus, NewJob};
pub use message::{MessageBody, QueueMessage, QueueStats};
pub use payload::{Payload, PriorPayloads};
pub use pipeline::{PipelineDefinition, StageDefinition};
pub use retry::RetryPolicy;
pub use stage::{Stage, StageLease, StageSpec, StageStatus};
