use crate::constants::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single step inside a stage's flattened task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub implementing_class: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stage_start: bool,
    #[serde(default)]
    pub stage_end: bool,
    #[serde(default)]
    pub loop_start: bool,
    #[serde(default)]
    pub loop_end: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, implementing_class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            implementing_class: implementing_class.into(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            stage_start: false,
            stage_end: false,
            loop_start: false,
            loop_end: false,
        }
    }

    pub fn reset(&mut self) {
        self.status = ExecutionStatus::NotStarted;
        self.start_time = None;
        self.end_time = None;
    }
}
