//! # Stage Definition Builders
//!
//! One [`StageDefinitionBuilder`] per stage type describes how a stage of that
//! type is planned: its task graph and the synthetic stages to run before,
//! after and in parallel with it. Builders are looked up by stage type through
//! a [`StageBuilderRegistry`].

use super::errors::{PlanningError, PlanningResult};
use super::task_graph::TaskGraph;
use super::time_window::RestrictExecutionDuringTimeWindowStage;
use super::wait::WaitStage;
use crate::models::Stage;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A synthetic stage a builder asks to have planned around its parent
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    pub stage_type: String,
    pub name: String,
    pub context: Map<String, Value>,
}

impl StageRequest {
    pub fn new(stage_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            stage_type: stage_type.into(),
            name: name.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

pub trait StageDefinitionBuilder: Send + Sync + fmt::Debug {
    fn stage_type(&self) -> &str;

    fn task_graph(&self, _stage: &Stage) -> TaskGraph {
        TaskGraph::default()
    }

    fn before_stages(&self, _stage: &Stage) -> Vec<StageRequest> {
        Vec::new()
    }

    fn after_stages(&self, _stage: &Stage) -> Vec<StageRequest> {
        Vec::new()
    }

    fn parallel_stages(&self, _stage: &Stage) -> Vec<StageRequest> {
        Vec::new()
    }

    /// Cleanup when a halted stage is canceled; returned values are merged
    /// into the stage context
    fn cancel(&self, _stage: &Stage) -> Option<Map<String, Value>> {
        None
    }
}

#[derive(Debug, Default, Clone)]
pub struct StageBuilderRegistry {
    builders: HashMap<String, Arc<dyn StageDefinitionBuilder>>,
}

impl StageBuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in time-window and wait stages
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RestrictExecutionDuringTimeWindowStage));
        registry.register(Arc::new(WaitStage));
        registry
    }

    /// Register a builder, replacing any previous one for its type
    pub fn register(&mut self, builder: Arc<dyn StageDefinitionBuilder>) {
        self.builders.insert(builder.stage_type().to_string(), builder);
    }

    pub fn with_builder(mut self, builder: Arc<dyn StageDefinitionBuilder>) -> Self {
        self.register(builder);
        self
    }

    pub fn get(&self, stage_type: &str) -> PlanningResult<Arc<dyn StageDefinitionBuilder>> {
        self.builders
            .get(stage_type)
            .cloned()
            .ok_or_else(|| PlanningError::unknown_stage_type(stage_type))
    }

    pub fn stage_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
