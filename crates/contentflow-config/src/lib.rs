//! Configuration for contentflow.
//!
//! This crate handles:
//! - Pipeline definitions (`pipeline.kdl`)
//! - Runtime settings from the environment

pub mod error;
pub mod pipeline;
pub mod runtime;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use runtime::RuntimeConfig;
