//! Pipeline configuration parsing.
//!
//! ```kdl
//! pipeline "article" {
//!     poll-interval-ms 500
//!     max-deliveries 10
//! }
//!
//! stage "research" max-concurrency=4 {
//!     max-attempts 3
//!     retry-delay-ms 30000
//!     backoff-factor 2.0
//!     max-retry-delay-ms 3600000
//!     visibility-timeout-ms 300000
//!     heartbeat-interval-ms 60000
//! }
//! ```
//!
//! Stages run in the order they appear in the file.

use crate::{ConfigError, ConfigResult};
use contentflow_core::{PipelineDefinition, RetryPolicy, StageDefinition, StageName};
use kdl::{KdlDocument, KdlNode};
use std::path::Path;
use std::time::Duration;

/// Read and parse a pipeline file.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<PipelineDefinition> {
    let text = std::fs::read_to_string(path)?;
    parse_pipeline(&text)
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = None;
    let mut poll_interval = PipelineDefinition::DEFAULT_POLL_INTERVAL;
    let mut max_deliveries = PipelineDefinition::DEFAULT_MAX_DELIVERIES;
    let mut stages: Vec<StageDefinition> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?,
                );
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "poll-interval-ms" => poll_interval = get_millis_arg(child)?,
                            "max-deliveries" => max_deliveries = get_u32_arg(child)?,
                            other => return Err(unknown_setting("pipeline", other)),
                        }
                    }
                }
            }
            "stage" => {
                let stage = parse_stage(node)?;
                if stages.iter().any(|s| s.name == stage.name) {
                    return Err(ConfigError::Duplicate(format!("stage '{}'", stage.name)));
                }
                stages.push(stage);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let name = name.ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
    if max_deliveries == 0 {
        return Err(ConfigError::invalid("max-deliveries", "must be at least 1"));
    }
    if poll_interval.is_zero() {
        return Err(ConfigError::invalid("poll-interval-ms", "must be positive"));
    }

    let pipeline = PipelineDefinition::new(name, stages)?
        .with_poll_interval(poll_interval)
        .with_max_deliveries(max_deliveries);
    Ok(pipeline)
}

fn parse_stage(node: &KdlNode) -> ConfigResult<StageDefinition> {
    let raw_name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;
    let name = StageName::new(&raw_name)
        .map_err(|e| ConfigError::invalid(format!("stage '{}'", raw_name), e.to_string()))?;

    let mut stage = StageDefinition::new(name);
    if let Some(concurrency) = get_integer_prop(node, "max-concurrency") {
        stage = stage.with_max_concurrency(to_usize("max-concurrency", concurrency)?);
    }

    let mut retry = RetryPolicy::default();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "max-concurrency" => {
                    let value = get_integer_arg(child)?;
                    stage = stage.with_max_concurrency(to_usize("max-concurrency", value)?);
                }
                "max-attempts" => retry.max_attempts = get_u32_arg(child)?,
                "retry-delay-ms" => retry.retry_delay = get_millis_arg(child)?,
                "backoff-factor" => retry.backoff_factor = get_float_arg(child)?,
                "max-retry-delay-ms" => retry.max_retry_delay = get_millis_arg(child)?,
                "visibility-timeout-ms" => {
                    stage = stage.with_visibility_timeout(get_millis_arg(child)?);
                }
                "heartbeat-interval-ms" => {
                    stage = stage.with_heartbeat_interval(get_millis_arg(child)?);
                }
                other => return Err(unknown_setting(&format!("stage '{}'", raw_name), other)),
            }
        }
    }

    Ok(stage.with_retry(retry))
}

fn unknown_setting(owner: &str, key: &str) -> ConfigError {
    ConfigError::invalid(key, format!("unknown setting in {}", owner))
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_integer_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn get_integer_arg(node: &KdlNode) -> ConfigResult<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected an integer"))
}

fn get_float_arg(node: &KdlNode) -> ConfigResult<f64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value());
    value
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected a number"))
}

fn get_u32_arg(node: &KdlNode) -> ConfigResult<u32> {
    let value = get_integer_arg(node)?;
    u32::try_from(value)
        .map_err(|_| ConfigError::invalid(node.name().value(), format!("{} is out of range", value)))
}

fn get_millis_arg(node: &KdlNode) -> ConfigResult<Duration> {
    let value = get_integer_arg(node)?;
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::invalid(node.name().value(), format!("{} is out of range", value)))
}

fn to_usize(field: &str, value: i128) -> ConfigResult<usize> {
    usize::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("{} is out of range", value)))
}
