use super::task::Task;
use crate::constants::{context_keys, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Which side of its parent a synthetic stage runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyntheticStageOwner {
    StageBefore,
    StageAfter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub ref_id: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub requisite_stage_ref_ids: BTreeSet<String>,
    pub parent_stage_id: Option<String>,
    pub synthetic_stage_owner: Option<SyntheticStageOwner>,
}

impl Stage {
    pub fn new(stage_type: impl Into<String>, name: impl Into<String>, ref_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ref_id: ref_id.into(),
            stage_type: stage_type.into(),
            name: name.into(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            context: Map::new(),
            outputs: Map::new(),
            tasks: Vec::new(),
            requisite_stage_ref_ids: BTreeSet::new(),
            parent_stage_id: None,
            synthetic_stage_owner: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_requisites<I, S>(mut self, ref_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requisite_stage_ref_ids = ref_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn is_synthetic(&self) -> bool {
        self.parent_stage_id.is_some()
    }

    pub fn is_initial(&self) -> bool {
        self.requisite_stage_ref_ids.is_empty()
    }

    pub fn task_by_id(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_by_id_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn first_task(&self) -> Option<&Task> {
        self.tasks.first()
    }

    /// Task following `task` in declaration order, none past the stage end
    pub fn next_task(&self, task: &Task) -> Option<&Task> {
        if task.stage_end {
            return None;
        }
        let index = self.tasks.iter().position(|t| t.id == task.id)?;
        self.tasks.get(index + 1)
    }

    /// Status a failure should resolve to, honouring the stage's failure strategy
    pub fn failure_status(&self, default: ExecutionStatus) -> ExecutionStatus {
        if self.context_flag(context_keys::CONTINUE_PIPELINE) {
            ExecutionStatus::FailedContinue
        } else if self.context.get(context_keys::FAIL_PIPELINE) == Some(&Value::Bool(false)) {
            ExecutionStatus::Stopped
        } else {
            default
        }
    }

    pub fn has_planning_failure(&self) -> bool {
        self.context_flag(context_keys::BEFORE_STAGE_PLANNING_FAILED)
    }

    pub fn context_flag(&self, key: &str) -> bool {
        self.context.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn context_u64(&self, key: &str) -> Option<u64> {
        self.context.get(key).and_then(Value::as_u64)
    }

    /// Back to a never-run state, dropping any planned tasks
    pub fn reset(&mut self) {
        self.status = ExecutionStatus::NotStarted;
        self.start_time = None;
        self.end_time = None;
        self.tasks.clear();
        self.context.remove(context_keys::EXCEPTION);
        self.context.remove(context_keys::BEFORE_STAGE_PLANNING_FAILED);
    }
}
