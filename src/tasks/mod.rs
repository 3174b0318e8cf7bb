//! # Task Implementations
//!
//! A stage's flattened task list names each step by implementing class; the
//! `RunTask` handler resolves that name to a [`Task`] through the
//! [`TaskResolver`] and executes it against the current execution state.
//!
//! A task returning `RUNNING` is polled again after its backoff. Tasks with a
//! [`RetryPolicy`] also carry a timeout measured from the task start.

use crate::clock::Clock;
use crate::constants::ExecutionStatus;
use crate::exceptions::TaskError;
use crate::models::{Execution, Stage};
use crate::pipeline::{WaitForTimeWindowTask, WaitTask};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub status: ExecutionStatus,
    /// Merged into the stage context
    pub context: Map<String, Value>,
    /// Merged into the stage outputs
    pub outputs: Map<String, Value>,
}

impl TaskResult {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            context: Map::new(),
            outputs: Map::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::new(ExecutionStatus::Succeeded)
    }

    pub fn running() -> Self {
        Self::new(ExecutionStatus::Running)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before a `RUNNING` task is executed again
    pub backoff: Duration,
    /// Total time the task may keep reporting `RUNNING`
    pub timeout: Duration,
}

#[async_trait]
pub trait Task: Send + Sync + fmt::Debug {
    /// Implementing class name the task is resolved by
    fn name(&self) -> &str;

    async fn execute(&self, execution: &Execution, stage: &Stage) -> Result<TaskResult, TaskError>;

    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Result to record when the task times out; must be a failure status
    fn on_timeout(&self, _stage: &Stage) -> Option<TaskResult> {
        None
    }

    /// Cleanup hook for a task whose execution was canceled
    async fn on_cancel(&self, _stage: &Stage) -> Option<TaskResult> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskResolver {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with the tasks of the built-in stage types
    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new()
            .with_task(Arc::new(WaitTask::new(clock.clone())))
            .with_task(Arc::new(WaitForTimeWindowTask::new(clock)))
    }

    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.name().to_string(), task);
    }

    pub fn with_task(mut self, task: Arc<dyn Task>) -> Self {
        self.register(task);
        self
    }

    pub fn resolve(&self, implementing_class: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(implementing_class).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
