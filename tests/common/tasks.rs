//! Scripted task implementations for driving pipelines through specific paths

use async_trait::async_trait;
use orca_queue::exceptions::TaskError;
use orca_queue::models::{Execution, Stage};
use orca_queue::tasks::{Task, TaskResult};
use orca_queue::ExecutionStatus;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const ECHO_TASK: &str = "EchoTask";
pub const FAILING_TASK: &str = "FailingTask";
pub const FLAKY_TASK: &str = "FlakyTask";
pub const COUNTING_TASK: &str = "CountingTask";
pub const REDIRECT_ONCE_TASK: &str = "RedirectOnceTask";
pub const FAIL_ONCE_TASK: &str = "FailOnceTask";

/// Succeeds immediately, echoing the stage name into the outputs
#[derive(Debug, Default)]
pub struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    fn name(&self) -> &str {
        ECHO_TASK
    }

    async fn execute(&self, _execution: &Execution, stage: &Stage) -> Result<TaskResult, TaskError> {
        Ok(TaskResult::succeeded().with_output("echo", json!(stage.name)))
    }
}

#[derive(Debug, Default)]
pub struct FailingTask;

#[async_trait]
impl Task for FailingTask {
    fn name(&self) -> &str {
        FAILING_TASK
    }

    async fn execute(&self, _execution: &Execution, _stage: &Stage) -> Result<TaskResult, TaskError> {
        Err(TaskError::user("deliberate failure"))
    }
}

/// Fails with a retryable error a fixed number of times, then succeeds
#[derive(Debug, Default)]
pub struct FlakyTask {
    failures_left: AtomicUsize,
    runs: AtomicUsize,
}

impl FlakyTask {
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for FlakyTask {
    fn name(&self) -> &str {
        FLAKY_TASK
    }

    async fn execute(&self, _execution: &Execution, _stage: &Stage) -> Result<TaskResult, TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(TaskError::retryable("transient outage"));
        }
        Ok(TaskResult::succeeded())
    }
}

#[derive(Debug, Default)]
pub struct CountingTask {
    runs: AtomicUsize,
}

impl CountingTask {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for CountingTask {
    fn name(&self) -> &str {
        COUNTING_TASK
    }

    async fn execute(&self, _execution: &Execution, _stage: &Stage) -> Result<TaskResult, TaskError> {
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TaskResult::succeeded().with_output("attemptRuns", json!(runs)))
    }
}

/// Asks for its enclosing loop to run again on the first execution only
#[derive(Debug, Default)]
pub struct RedirectOnceTask {
    runs: AtomicUsize,
}

impl RedirectOnceTask {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for RedirectOnceTask {
    fn name(&self) -> &str {
        REDIRECT_ONCE_TASK
    }

    async fn execute(&self, _execution: &Execution, _stage: &Stage) -> Result<TaskResult, TaskError> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(TaskResult::new(ExecutionStatus::Redirect));
        }
        Ok(TaskResult::succeeded())
    }
}

/// Fails with a user error on the first run only, so a restart succeeds
#[derive(Debug, Default)]
pub struct FailOnceTask {
    runs: AtomicUsize,
}

#[async_trait]
impl Task for FailOnceTask {
    fn name(&self) -> &str {
        FAIL_ONCE_TASK
    }

    async fn execute(&self, _execution: &Execution, _stage: &Stage) -> Result<TaskResult, TaskError> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TaskError::user("first attempt rejected"));
        }
        Ok(TaskResult::succeeded())
    }
}
