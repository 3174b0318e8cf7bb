//! # RunTask Handler
//!
//! Executes a single task implementation against the current execution and
//! translates its [`TaskResult`] (or [`TaskError`]) into the next message.
//!
//! Before executing, the handler checks whether the work should still happen
//! at all: a canceled or finished execution cancels the task, a paused one
//! parks it, a manually skipped stage skips it, and an expired stage or task
//! timeout fails it. A task that reports `RUNNING` is polled again after its
//! backoff, which is how long-running tasks wait for external state without
//! holding a worker.

use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::constants::{context_keys, ExecutionStatus};
use crate::exceptions::{ExceptionDetails, TaskError};
use crate::messaging::{CompleteTask, InvalidTaskType, Message, MessageKind, RunTask, TaskAddress};
use crate::models::{Execution, Stage, Task};
use crate::repository::ExecutionRepository;
use crate::tasks::{Task as TaskImpl, TaskResult};
use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct RunTaskHandler {
    ctx: HandlerContext,
}

impl RunTaskHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn run(
        &self,
        message: &Message,
        execution: &Execution,
        stage: Stage,
        task: &Task,
        address: &TaskAddress,
        implementation: &dyn TaskImpl,
    ) -> HandlerResult<()> {
        if execution.canceled {
            let mut stage = stage;
            if let Some(cleanup) = implementation.on_cancel(&stage).await {
                merge_result(&mut stage, &cleanup);
                self.ctx.store_stage(execution, &stage).await?;
            }
            return self.complete(address, ExecutionStatus::Canceled, None).await;
        }
        if execution.status.is_complete() {
            return self.complete(address, ExecutionStatus::Canceled, None).await;
        }
        if execution.status == ExecutionStatus::Paused {
            return self.ctx.push(Message::PauseTask(address.clone())).await;
        }
        if stage.status.is_halt() {
            return self.complete(address, ExecutionStatus::Canceled, None).await;
        }
        if execution.is_manually_skipped(&stage) {
            info!(stage_id = %stage.id, task = %task.name, "⏭️ Skipping task of manually skipped stage");
            return self.complete(address, ExecutionStatus::Skipped, None).await;
        }

        if let Some(elapsed_ms) = self.elapsed_past_timeout(execution, &stage, task, implementation) {
            let fallback = implementation
                .on_timeout(&stage)
                .filter(|r| matches!(r.status, ExecutionStatus::Terminal | ExecutionStatus::FailedContinue));
            return match fallback {
                Some(result) => self.apply(message, execution, stage, address, implementation, result).await,
                None => {
                    self.fail(
                        message,
                        execution,
                        stage,
                        task,
                        address,
                        implementation,
                        TaskError::Timeout { elapsed_ms },
                    )
                    .await
                }
            };
        }

        match implementation.execute(execution, &stage).await {
            Ok(result) => self.apply(message, execution, stage, address, implementation, result).await,
            Err(e) => self.fail(message, execution, stage, task, address, implementation, e).await,
        }
    }

    /// Milliseconds past the stage or task timeout, if either has expired
    fn elapsed_past_timeout(
        &self,
        execution: &Execution,
        stage: &Stage,
        task: &Task,
        implementation: &dyn TaskImpl,
    ) -> Option<i64> {
        let now = self.ctx.clock.now();

        if let Some(owner) = execution.parent_with_timeout(stage) {
            if let (Some(timeout_ms), Some(start)) =
                (owner.context_u64(context_keys::STAGE_TIMEOUT_MS), owner.start_time)
            {
                let elapsed = (now - start).num_milliseconds()
                    - execution.paused_ms_since(Some(start))
                    - execution.time_window_ms(owner);
                if elapsed > timeout_ms as i64 {
                    warn!(
                        execution_id = %execution.id,
                        stage_id = %stage.id,
                        timeout_ms,
                        elapsed_ms = elapsed,
                        "⏰ Stage timed out"
                    );
                    return Some(elapsed);
                }
            }
        }

        let policy = implementation.retry_policy()?;
        let start = task.start_time?;
        let elapsed = (now - start).num_milliseconds() - execution.paused_ms_since(Some(start));
        if elapsed > policy.timeout.as_millis() as i64 {
            warn!(
                execution_id = %execution.id,
                stage_id = %stage.id,
                task = %task.name,
                timeout_ms = policy.timeout.as_millis() as u64,
                elapsed_ms = elapsed,
                "⏰ Task timed out"
            );
            return Some(elapsed);
        }
        None
    }

    /// The stage as stored now; status changes made while the task ran
    /// (skip, pause, cancel) must survive the result being merged
    async fn current_stage(&self, execution: &Execution, snapshot: Stage) -> HandlerResult<Stage> {
        let stored = self
            .ctx
            .repository
            .retrieve(execution.execution_type, &execution.id)
            .await?;
        Ok(stored.stage_by_id(&snapshot.id).cloned().unwrap_or(snapshot))
    }

    fn backoff(&self, implementation: &dyn TaskImpl) -> Duration {
        implementation
            .retry_policy()
            .map(|p| p.backoff)
            .unwrap_or_else(|| self.ctx.config.tasks.non_retryable_backoff())
    }

    async fn apply(
        &self,
        message: &Message,
        execution: &Execution,
        stage: Stage,
        address: &TaskAddress,
        implementation: &dyn TaskImpl,
        result: TaskResult,
    ) -> HandlerResult<()> {
        let mut stage = self.current_stage(execution, stage).await?;
        merge_result(&mut stage, &result);
        self.ctx.store_stage(execution, &stage).await?;

        match result.status {
            ExecutionStatus::Running => {
                let backoff = self.backoff(implementation);
                debug!(task_id = %address.task_id, backoff_ms = backoff.as_millis() as u64, "Task still running");
                self.ctx.push_delayed(message.clone(), backoff).await
            }
            status @ (ExecutionStatus::Succeeded
            | ExecutionStatus::Redirect
            | ExecutionStatus::Skipped
            | ExecutionStatus::FailedContinue
            | ExecutionStatus::Stopped) => self.complete(address, status, None).await,
            ExecutionStatus::Canceled => {
                if let Some(cleanup) = implementation.on_cancel(&stage).await {
                    merge_result(&mut stage, &cleanup);
                    self.ctx.store_stage(execution, &stage).await?;
                }
                let status = stage.failure_status(ExecutionStatus::Canceled);
                self.complete(address, status, Some(ExecutionStatus::Canceled)).await
            }
            ExecutionStatus::Terminal => {
                let status = stage.failure_status(ExecutionStatus::Terminal);
                self.complete(address, status, Some(ExecutionStatus::Terminal)).await
            }
            other => {
                error!(task_id = %address.task_id, status = %other, "Task returned a status it cannot end with");
                let status = stage.failure_status(ExecutionStatus::Terminal);
                self.complete(address, status, Some(other)).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        message: &Message,
        execution: &Execution,
        stage: Stage,
        task: &Task,
        address: &TaskAddress,
        implementation: &dyn TaskImpl,
        err: TaskError,
    ) -> HandlerResult<()> {
        let details = self
            .ctx
            .exception_handlers
            .handle(&task.name, &err)
            .unwrap_or_else(|| ExceptionDetails {
                should_retry: false,
                error_type: err.error_type().to_string(),
                message: err.to_string(),
                details: Value::Null,
            });

        if details.should_retry {
            let backoff = self.backoff(implementation);
            warn!(
                execution_id = %execution.id,
                stage_id = %stage.id,
                task = %task.name,
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "🔄 Retrying task after error"
            );
            return self.ctx.push_delayed(message.clone(), backoff).await;
        }

        if matches!(err, TaskError::Timeout { .. })
            && stage.context_flag(context_keys::MARK_SUCCESSFUL_ON_TIMEOUT)
        {
            info!(stage_id = %stage.id, task = %task.name, "Timed out task marked successful");
            return self.complete(address, ExecutionStatus::Succeeded, None).await;
        }

        error!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            task = %task.name,
            error_type = %details.error_type,
            error = %err,
            "❌ Task failed"
        );
        let mut stage = self.current_stage(execution, stage).await?;
        stage.context.insert(
            context_keys::EXCEPTION.to_string(),
            serde_json::to_value(&details).unwrap_or_default(),
        );
        self.ctx.store_stage(execution, &stage).await?;
        let status = stage.failure_status(ExecutionStatus::Terminal);
        self.complete(address, status, Some(ExecutionStatus::Terminal)).await
    }

    async fn complete(
        &self,
        address: &TaskAddress,
        status: ExecutionStatus,
        original_status: Option<ExecutionStatus>,
    ) -> HandlerResult<()> {
        self.ctx
            .push(Message::CompleteTask(CompleteTask {
                task: address.clone(),
                status,
                original_status,
            }))
            .await
    }
}

/// Fold a task result into the stage; the stage timeout is never published
/// as an output
fn merge_result(stage: &mut Stage, result: &TaskResult) {
    stage
        .context
        .extend(result.context.iter().map(|(k, v)| (k.clone(), v.clone())));
    stage.outputs.extend(
        result
            .outputs
            .iter()
            .filter(|(k, _)| k.as_str() != context_keys::STAGE_TIMEOUT_MS)
            .map(|(k, v)| (k.clone(), v.clone())),
    );
}

#[async_trait]
impl MessageHandler for RunTaskHandler {
    fn name(&self) -> &'static str {
        "RunTaskHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::RunTask]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::RunTask(RunTask {
            task: address,
            task_type,
        }) = message
        else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage, task)) = self.ctx.resolve_task(address).await? else {
            return Ok(());
        };
        let Some(implementation) = self.ctx.tasks.resolve(task_type) else {
            warn!(stage_id = %stage.id, task_type = %task_type, "No task implementation registered");
            return self
                .ctx
                .push(Message::InvalidTaskType(InvalidTaskType {
                    stage: address.stage.clone(),
                    class_name: task_type.clone(),
                }))
                .await;
        };
        if task.status != ExecutionStatus::Running {
            debug!(task_id = %task.id, status = %task.status, "Task not running");
            return Ok(());
        }

        let started = Instant::now();
        let outcome = self
            .run(message, &execution, stage, &task, address, implementation.as_ref())
            .await;
        let elapsed = started.elapsed();
        if elapsed > self.ctx.config.tasks.warning_threshold() {
            warn!(
                execution_id = %execution.id,
                task = %task.name,
                task_type = %task_type,
                elapsed_ms = elapsed.as_millis() as u64,
                "🐌 Slow task invocation"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::handlers::test_support::{drain, fixture, Fixture};
    use crate::messaging::ExecutionAddress;
    use crate::models::ExecutionType;
    use crate::repository::InMemoryExecutionRepository;
    use crate::tasks::{RetryPolicy, TaskResolver};
    use serde_json::json;
    use std::sync::Arc;

    /// Returns a fixed outcome and reports cleanup on cancel
    #[derive(Debug)]
    struct Scripted {
        outcome: fn() -> Result<TaskResult, TaskError>,
        policy: Option<RetryPolicy>,
    }

    #[async_trait]
    impl TaskImpl for Scripted {
        fn name(&self) -> &str {
            "ScriptedTask"
        }

        async fn execute(&self, _execution: &Execution, _stage: &Stage) -> Result<TaskResult, TaskError> {
            (self.outcome)()
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            self.policy
        }

        async fn on_cancel(&self, _stage: &Stage) -> Option<TaskResult> {
            Some(TaskResult::new(ExecutionStatus::Canceled).with_context("cleanedUp", json!(true)))
        }
    }

    /// Skips its own stage while running, as a concurrent SkipStage would
    #[derive(Debug)]
    struct SkippedWhileRunning {
        repository: Arc<InMemoryExecutionRepository>,
    }

    #[async_trait]
    impl TaskImpl for SkippedWhileRunning {
        fn name(&self) -> &str {
            "ScriptedTask"
        }

        async fn execute(&self, execution: &Execution, stage: &Stage) -> Result<TaskResult, TaskError> {
            let mut skipped = stage.clone();
            skipped.status = ExecutionStatus::Skipped;
            self.repository
                .store_stage(execution.execution_type, &execution.id, &skipped)
                .await
                .map_err(|e| TaskError::Failed(e.into()))?;
            Ok(TaskResult::succeeded().with_output("artifact", json!("app.tgz")))
        }
    }

    fn with_task(f: Fixture, task: impl TaskImpl + 'static) -> Fixture {
        let ctx = f
            .ctx
            .clone()
            .with_tasks(TaskResolver::new().with_task(Arc::new(task)));
        Fixture { ctx, ..f }
    }

    fn running_execution(f: &Fixture) -> Execution {
        let mut task = Task::new("1", "scripted", "ScriptedTask");
        task.status = ExecutionStatus::Running;
        task.start_time = Some(f.clock.now());
        task.stage_start = true;
        task.stage_end = true;
        let mut stage = Stage::new("scripted", "scripted", "1").with_id("s");
        stage.status = ExecutionStatus::Running;
        stage.start_time = Some(f.clock.now());
        stage.tasks = vec![task];
        let mut execution = Execution::pipeline("app").with_id("e1").with_stage(stage);
        execution.status = ExecutionStatus::Running;
        execution
    }

    fn run_task(execution: &Execution) -> (Message, TaskAddress) {
        let address = ExecutionAddress::from(execution).stage("s").task("1");
        let message = Message::RunTask(RunTask {
            task: address.clone(),
            task_type: "ScriptedTask".into(),
        });
        (message, address)
    }

    fn completed(address: &TaskAddress, status: ExecutionStatus, original: Option<ExecutionStatus>) -> Message {
        Message::CompleteTask(CompleteTask {
            task: address.clone(),
            status,
            original_status: original,
        })
    }

    #[tokio::test]
    async fn test_success_merges_outputs_and_completes() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || {
                    Ok(TaskResult::succeeded()
                        .with_context("deployed", json!("v2"))
                        .with_output("artifact", json!("app.tgz"))
                        .with_output(context_keys::STAGE_TIMEOUT_MS, json!(5)))
                },
                policy: None,
            },
        );
        let execution = running_execution(&f);
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        let stage = &stored.stages[0];
        assert_eq!(stage.context["deployed"], json!("v2"));
        assert_eq!(stage.outputs["artifact"], json!("app.tgz"));
        assert!(!stage.outputs.contains_key(context_keys::STAGE_TIMEOUT_MS));
        assert_eq!(
            drain(&f.queue).await,
            vec![completed(&address, ExecutionStatus::Succeeded, None)]
        );
    }

    #[tokio::test]
    async fn test_stage_status_changed_during_execution_is_kept() {
        let f = fixture();
        let task = SkippedWhileRunning {
            repository: f.repository.clone(),
        };
        let f = with_task(f, task);
        let execution = running_execution(&f);
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        let stage = &stored.stages[0];
        assert_eq!(stage.status, ExecutionStatus::Skipped);
        assert_eq!(stage.outputs["artifact"], json!("app.tgz"));
        assert_eq!(
            drain(&f.queue).await,
            vec![completed(&address, ExecutionStatus::Succeeded, None)]
        );
    }

    #[tokio::test]
    async fn test_running_task_is_polled_after_backoff() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || Ok(TaskResult::running()),
                policy: Some(RetryPolicy {
                    backoff: Duration::from_secs(5),
                    timeout: Duration::from_secs(600),
                }),
            },
        );
        let execution = running_execution(&f);
        f.repository.store(&execution).await.unwrap();
        let (message, _) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();
        assert!(drain(&f.queue).await.is_empty());

        f.clock.advance(Duration::from_secs(5));
        assert_eq!(drain(&f.queue).await, vec![message]);
    }

    #[tokio::test]
    async fn test_task_timeout_fails_task() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || Ok(TaskResult::running()),
                policy: Some(RetryPolicy {
                    backoff: Duration::from_secs(1),
                    timeout: Duration::from_secs(60),
                }),
            },
        );
        let execution = running_execution(&f);
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);
        f.clock.advance(Duration::from_secs(61));

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.stages[0].context[context_keys::EXCEPTION]["errorType"], json!("timeout"));
        assert_eq!(
            drain(&f.queue).await,
            vec![completed(&address, ExecutionStatus::Terminal, Some(ExecutionStatus::Terminal))]
        );
    }

    #[tokio::test]
    async fn test_stage_timeout_can_mark_successful() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || Ok(TaskResult::running()),
                policy: None,
            },
        );
        let mut execution = running_execution(&f);
        execution.stages[0]
            .context
            .insert(context_keys::STAGE_TIMEOUT_MS.into(), json!(1_000));
        execution.stages[0]
            .context
            .insert(context_keys::MARK_SUCCESSFUL_ON_TIMEOUT.into(), json!(true));
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);
        f.clock.advance(Duration::from_secs(2));

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        assert_eq!(
            drain(&f.queue).await,
            vec![completed(&address, ExecutionStatus::Succeeded, None)]
        );
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || Err(TaskError::retryable("connection reset")),
                policy: None,
            },
        );
        let execution = running_execution(&f);
        f.repository.store(&execution).await.unwrap();
        let (message, _) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        f.clock.advance(f.ctx.config.tasks.non_retryable_backoff());
        assert_eq!(drain(&f.queue).await, vec![message]);
    }

    #[tokio::test]
    async fn test_user_error_honours_continue_pipeline() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || Err(TaskError::user("bad input")),
                policy: None,
            },
        );
        let mut execution = running_execution(&f);
        execution.stages[0]
            .context
            .insert(context_keys::CONTINUE_PIPELINE.into(), json!(true));
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.stages[0].context[context_keys::EXCEPTION]["message"], json!("bad input"));
        assert_eq!(
            drain(&f.queue).await,
            vec![completed(&address, ExecutionStatus::FailedContinue, Some(ExecutionStatus::Terminal))]
        );
    }

    #[tokio::test]
    async fn test_canceled_execution_runs_cleanup() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || Ok(TaskResult::succeeded()),
                policy: None,
            },
        );
        let mut execution = running_execution(&f);
        execution.canceled = true;
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.stages[0].context["cleanedUp"], json!(true));
        assert_eq!(
            drain(&f.queue).await,
            vec![completed(&address, ExecutionStatus::Canceled, None)]
        );
    }

    #[tokio::test]
    async fn test_paused_execution_pauses_task() {
        let f = with_task(
            fixture(),
            Scripted {
                outcome: || Ok(TaskResult::succeeded()),
                policy: None,
            },
        );
        let mut execution = running_execution(&f);
        execution.status = ExecutionStatus::Paused;
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        assert_eq!(drain(&f.queue).await, vec![Message::PauseTask(address)]);
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_reported() {
        let f = fixture();
        let execution = running_execution(&f);
        f.repository.store(&execution).await.unwrap();
        let (message, address) = run_task(&execution);

        RunTaskHandler::new(f.ctx.clone()).handle(&message).await.unwrap();

        assert_eq!(
            drain(&f.queue).await,
            vec![Message::InvalidTaskType(InvalidTaskType {
                stage: address.stage,
                class_name: "ScriptedTask".into(),
            })]
        );
    }
}
