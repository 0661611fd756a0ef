//! Stage name → handler lookup.

use contentflow_core::{PipelineDefinition, StageDefinition, StageHandler, StageName};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{SchedulerError, SchedulerResult};

/// Handlers for the stages of a pipeline.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StageName, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `stage`, replacing any earlier one.
    pub fn register<H: StageHandler + 'static>(mut self, stage: StageName, handler: H) -> Self {
        self.insert(stage, Arc::new(handler));
        self
    }

    pub fn insert(&mut self, stage: StageName, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage, handler);
    }

    pub fn get(&self, stage: &StageName) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Pair every stage of `pipeline` with its handler, in pipeline order.
    pub fn resolve(
        &self,
        pipeline: &PipelineDefinition,
    ) -> SchedulerResult<Vec<(StageDefinition, Arc<dyn StageHandler>)>> {
        pipeline
            .stages
            .iter()
            .map(|stage| {
                self.get(&stage.name)
                    .map(|handler| (stage.clone(), handler))
                    .ok_or_else(|| SchedulerError::MissingHandler(stage.name.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use contentflow_core::{StageContext, StageError};

    struct Noop;

    #[async_trait]
    impl StageHandler for Noop {
        async fn run(&self, _ctx: StageContext) -> Result<serde_json::Value, StageError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn name(s: &str) -> StageName {
        StageName::new(s).unwrap()
    }

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition::new(
            "article",
            vec![
                StageDefinition::new(name("research")),
                StageDefinition::new(name("outline")),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_in_pipeline_order() {
        let registry = HandlerRegistry::new()
            .register(name("outline"), Noop)
            .register(name("research"), Noop);
        let resolved = registry.resolve(&pipeline()).unwrap();
        let names: Vec<&str> = resolved.iter().map(|(s, _)| s.name.as_str()).collect();
        assert_eq!(names, vec!["research", "outline"]);
    }

    #[test]
    fn test_resolve_reports_missing_handler() {
        let registry = HandlerRegistry::new().register(name("research"), Noop);
        match registry.resolve(&pipeline()) {
            Err(SchedulerError::MissingHandler(stage)) => assert_eq!(stage.as_str(), "outline"),
            _ => panic!("expected missing handler"),
        }
    }
}
