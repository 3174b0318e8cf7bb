use super::stage_definition::StageDefinitionBuilder;
use super::task_graph::TaskGraph;
use crate::clock::Clock;
use crate::constants::context_keys;
use crate::exceptions::TaskError;
use crate::models::{Execution, Stage};
use crate::tasks::{RetryPolicy, Task, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT_STAGE_TYPE: &str = "wait";
pub const WAIT_TASK: &str = "WaitTask";

/// Pauses the pipeline for `waitTime` seconds
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitStage;

impl StageDefinitionBuilder for WaitStage {
    fn stage_type(&self) -> &str {
        WAIT_STAGE_TYPE
    }

    fn task_graph(&self, _stage: &Stage) -> TaskGraph {
        TaskGraph::builder().with_task("wait", WAIT_TASK).build()
    }
}

#[derive(Debug)]
pub struct WaitTask {
    clock: Arc<dyn Clock>,
}

impl WaitTask {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Task for WaitTask {
    fn name(&self) -> &str {
        WAIT_TASK
    }

    async fn execute(&self, _execution: &Execution, stage: &Stage) -> Result<TaskResult, TaskError> {
        if stage.context_flag(context_keys::SKIP_REMAINING_WAIT) {
            return Ok(TaskResult::succeeded());
        }
        let wait_secs = match stage.context.get(context_keys::WAIT_TIME) {
            None => 0,
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| TaskError::user(format!("Invalid waitTime: {value}")))?,
        };
        let Some(started) = stage.start_time else {
            return Ok(TaskResult::running());
        };

        let elapsed_ms = (self.clock.now() - started).num_milliseconds();
        let wait_ms = i64::try_from(wait_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        if elapsed_ms >= wait_ms {
            Ok(TaskResult::succeeded())
        } else {
            Ok(TaskResult::running())
        }
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy {
            backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(365 * 24 * 60 * 60),
        })
    }
}
