//! Time-window restriction stage.
//!
//! Planned as the first before stage of any stage whose context sets
//! `restrictExecutionDuringTimeWindow`. Its single task stays `RUNNING` until
//! the current UTC time falls inside one of the configured windows:
//!
//! ```json
//! "restrictedExecutionWindow": {
//!   "whitelist": [{"startHour": 22, "startMin": 0, "endHour": 2, "endMin": 0}],
//!   "days": [1, 2, 3, 4, 5]
//! }
//! ```
//!
//! A window whose end is before its start wraps past midnight. `days` uses
//! ISO numbering (1 = Monday); empty lists place no restriction.

use super::stage_definition::StageDefinitionBuilder;
use super::task_graph::TaskGraph;
use super::TIME_WINDOW_STAGE_TYPE;
use crate::clock::Clock;
use crate::constants::context_keys;
use crate::exceptions::TaskError;
use crate::models::{Execution, Stage};
use crate::tasks::{RetryPolicy, Task, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT_FOR_TIME_WINDOW_TASK: &str = "WaitForTimeWindowTask";

#[derive(Debug, Clone, Copy, Default)]
pub struct RestrictExecutionDuringTimeWindowStage;

impl StageDefinitionBuilder for RestrictExecutionDuringTimeWindowStage {
    fn stage_type(&self) -> &str {
        TIME_WINDOW_STAGE_TYPE
    }

    fn task_graph(&self, _stage: &Stage) -> TaskGraph {
        TaskGraph::builder()
            .with_task("suspendExecutionDuringTimeWindow", WAIT_FOR_TIME_WINDOW_TASK)
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start_hour: u32,
    #[serde(default)]
    pub start_min: u32,
    pub end_hour: u32,
    #[serde(default)]
    pub end_min: u32,
}

impl TimeWindow {
    fn contains(&self, minute_of_day: u32) -> bool {
        let start = self.start_hour * 60 + self.start_min;
        let end = self.end_hour * 60 + self.end_min;
        if start <= end {
            (start..end).contains(&minute_of_day)
        } else {
            minute_of_day >= start || minute_of_day < end
        }
    }

    fn is_valid(&self) -> bool {
        self.start_hour < 24 && self.end_hour < 24 && self.start_min < 60 && self.end_min < 60
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestrictedExecutionWindow {
    pub whitelist: Vec<TimeWindow>,
    pub days: Vec<u32>,
}

impl RestrictedExecutionWindow {
    pub fn from_stage(stage: &Stage) -> Result<Self, TaskError> {
        let Some(value) = stage.context.get(context_keys::RESTRICTED_EXECUTION_WINDOW) else {
            return Ok(Self::default());
        };
        let window: Self = serde_json::from_value(value.clone())
            .map_err(|e| TaskError::user(format!("Invalid restrictedExecutionWindow: {e}")))?;
        if let Some(bad) = window.whitelist.iter().find(|w| !w.is_valid()) {
            return Err(TaskError::user(format!("Invalid time window: {bad:?}")));
        }
        if let Some(day) = window.days.iter().find(|d| !(1..=7).contains(*d)) {
            return Err(TaskError::user(format!("Invalid day of week: {day}")));
        }
        Ok(window)
    }

    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        let day_allowed =
            self.days.is_empty() || self.days.contains(&now.weekday().number_from_monday());
        let minute_of_day = now.hour() * 60 + now.minute();
        let time_allowed =
            self.whitelist.is_empty() || self.whitelist.iter().any(|w| w.contains(minute_of_day));
        day_allowed && time_allowed
    }
}

#[derive(Debug)]
pub struct WaitForTimeWindowTask {
    clock: Arc<dyn Clock>,
}

impl WaitForTimeWindowTask {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Task for WaitForTimeWindowTask {
    fn name(&self) -> &str {
        WAIT_FOR_TIME_WINDOW_TASK
    }

    async fn execute(&self, _execution: &Execution, stage: &Stage) -> Result<TaskResult, TaskError> {
        if stage.context_flag(context_keys::SKIP_REMAINING_WAIT) {
            return Ok(TaskResult::succeeded());
        }
        let window = RestrictedExecutionWindow::from_stage(stage)?;
        let now = self.clock.now();
        if window.allows(now) {
            Ok(TaskResult::succeeded())
        } else {
            Ok(TaskResult::running().with_context("lastWindowCheck", json!(now.to_rfc3339())))
        }
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy {
            backoff: Duration::from_secs(30),
            timeout: Duration::from_secs(7 * 24 * 60 * 60),
        })
    }
}
