use super::stage::Stage;
use crate::constants::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Kind of execution a message addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Pipeline,
    Orchestration,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Orchestration => "orchestration",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pause bookkeeping, used to discount paused time from timeouts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedDetails {
    pub paused_by: Option<String>,
    pub pause_time: Option<DateTime<Utc>>,
    pub resumed_by: Option<String>,
    pub resume_time: Option<DateTime<Utc>>,
}

impl PausedDetails {
    pub fn is_paused(&self) -> bool {
        self.pause_time.is_some() && self.resume_time.is_none()
    }

    /// Milliseconds spent paused, zero while still paused
    pub fn paused_ms(&self) -> i64 {
        match (self.pause_time, self.resume_time) {
            (Some(paused), Some(resumed)) => (resumed - paused).num_milliseconds().max(0),
            _ => 0,
        }
    }
}

/// Aggregate root for one pipeline or orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,
    pub application: String,
    pub name: Option<String>,
    pub status: ExecutionStatus,
    pub build_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub canceled: bool,
    pub canceled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    pub paused: Option<PausedDetails>,
    pub pipeline_config_id: Option<String>,
    #[serde(default)]
    pub limit_concurrent: bool,
    #[serde(default)]
    pub keep_waiting_pipelines: bool,
}

impl Execution {
    pub fn new(execution_type: ExecutionType, application: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_type,
            application: application.into(),
            name: None,
            status: ExecutionStatus::NotStarted,
            build_time: Some(Utc::now()),
            start_time: None,
            end_time: None,
            context: Map::new(),
            stages: Vec::new(),
            canceled: false,
            canceled_by: None,
            cancellation_reason: None,
            paused: None,
            pipeline_config_id: None,
            limit_concurrent: false,
            keep_waiting_pipelines: false,
        }
    }

    pub fn pipeline(application: impl Into<String>) -> Self {
        Self::new(ExecutionType::Pipeline, application)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_pipeline_config(mut self, config_id: impl Into<String>, limit_concurrent: bool) -> Self {
        self.pipeline_config_id = Some(config_id.into());
        self.limit_concurrent = limit_concurrent;
        self
    }

    pub fn stage_by_id(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_by_id_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    pub fn stage_by_ref(&self, ref_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.ref_id == ref_id)
    }

    /// Replace a stage with the same id, or append it when absent
    pub fn upsert_stage(&mut self, stage: Stage) {
        match self.stages.iter_mut().find(|s| s.id == stage.id) {
            Some(existing) => *existing = stage,
            None => self.stages.push(stage),
        }
    }

    /// Insert a stage relative to an anchor stage; falls back to appending
    pub fn insert_stage(&mut self, stage: Stage, position: &StagePosition) {
        let index = match position {
            StagePosition::Before(anchor) => self.stages.iter().position(|s| &s.id == anchor),
            StagePosition::After(anchor) => self
                .stages
                .iter()
                .position(|s| &s.id == anchor)
                .map(|i| i + 1),
            StagePosition::End => None,
        };
        match index {
            Some(index) => self.stages.insert(index, stage),
            None => self.stages.push(stage),
        }
    }

    /// Replace a stage in place when its id is known, else insert it
    pub fn place_stage(&mut self, stage: Stage, position: &StagePosition) {
        if self.stage_by_id(&stage.id).is_some() {
            self.upsert_stage(stage);
        } else {
            self.insert_stage(stage, position);
        }
    }

    pub fn remove_stage(&mut self, stage_id: &str) -> Option<Stage> {
        let index = self.stages.iter().position(|s| s.id == stage_id)?;
        Some(self.stages.remove(index))
    }

    /// Paused time that overlaps work started at `since`
    pub fn paused_ms_since(&self, since: Option<DateTime<Utc>>) -> i64 {
        match (&self.paused, since) {
            (Some(paused), Some(since)) if paused.pause_time.is_some_and(|t| t >= since) => {
                paused.paused_ms()
            }
            _ => 0,
        }
    }
}

/// Where a newly planned stage lands in the execution's stage list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagePosition {
    Before(String),
    After(String),
    End,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_insert_stage_positions() {
        let parent = Stage::new("wait", "parent", "1");
        let parent_id = parent.id.clone();
        let mut execution = Execution::pipeline("app").with_stage(parent);

        execution.insert_stage(Stage::new("wait", "before", "1<1"), &StagePosition::Before(parent_id.clone()));
        execution.insert_stage(Stage::new("wait", "after", "1>1"), &StagePosition::After(parent_id.clone()));
        execution.insert_stage(Stage::new("wait", "tail", "2"), &StagePosition::End);

        let refs: Vec<&str> = execution.stages.iter().map(|s| s.ref_id.as_str()).collect();
        assert_eq!(refs, vec!["1<1", "1", "1>1", "2"]);

        assert!(execution.remove_stage(&parent_id).is_some());
        assert!(execution.stage_by_id(&parent_id).is_none());
    }

    #[test]
    fn test_paused_time_only_counts_after_start() {
        let now = Utc::now();
        let mut execution = Execution::pipeline("app");
        execution.paused = Some(PausedDetails {
            pause_time: Some(now),
            resume_time: Some(now + Duration::seconds(30)),
            ..Default::default()
        });

        assert_eq!(execution.paused_ms_since(Some(now - Duration::seconds(5))), 30_000);
        assert_eq!(execution.paused_ms_since(Some(now + Duration::seconds(5))), 0);
        assert_eq!(execution.paused_ms_since(None), 0);
    }
}
