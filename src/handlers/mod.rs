//! # Message Handlers
//!
//! One [`MessageHandler`] per message kind drives the execution state
//! machine. Every handler re-reads the execution, decides from its current
//! state, writes back the narrowest piece it changed and pushes follow-up
//! messages. Handlers ignore messages whose target already moved past the
//! state the message expects, so redelivery is harmless.
//!
//! Lookups go through the resolution chain on [`HandlerContext`]: an unknown
//! execution, stage or task becomes an `InvalidExecutionId`, `InvalidStageId`
//! or `InvalidTaskId` message and the handler stops without touching the
//! repository.

pub mod configuration_error;
pub mod dead_message;
pub mod errors;
pub mod execution;
pub mod run_task;
pub mod stage;
pub mod task;

use crate::clock::{Clock, SystemClock};
use crate::config::QueueSystemConfig;
use crate::constants::ExecutionStatus;
use crate::exceptions::ExceptionHandlerChain;
use crate::messaging::{
    ContinueParentStage, ExecutionAddress, Message, MessageKind, StageAddress,
    StartWaitingExecutions, TaskAddress,
};
use crate::models::{Execution, Stage, Task};
use crate::pipeline::StageBuilderRegistry;
use crate::queue::{NoopQueueMetrics, Queue, QueueMetrics};
use crate::repository::ExecutionRepository;
use crate::tasks::TaskResolver;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use configuration_error::ConfigurationErrorHandler;
pub use dead_message::{DeadMessageHandler, DEAD_MESSAGE_USER};
pub use errors::{HandlerError, HandlerResult};
pub use execution::{
    CancelExecutionHandler, CompleteExecutionHandler, RescheduleExecutionHandler,
    ResumeExecutionHandler, StartExecutionHandler, StartWaitingExecutionsHandler,
};
pub use run_task::RunTaskHandler;
pub use stage::{
    AbortStageHandler, CancelStageHandler, CompleteStageHandler, ContinueParentStageHandler,
    PauseStageHandler, RestartStageHandler, ResumeStageHandler, SkipStageHandler,
    StartStageHandler,
};
pub use task::{CompleteTaskHandler, PauseTaskHandler, ResumeTaskHandler, StartTaskHandler};

#[async_trait]
pub trait MessageHandler: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Kinds this handler accepts
    fn message_kinds(&self) -> &'static [MessageKind];

    async fn handle(&self, message: &Message) -> HandlerResult<()>;

    /// Entry point used by the processor; rejects kinds the handler does not
    /// declare before dispatching to [`MessageHandler::handle`]
    async fn invoke(&self, message: &Message) -> HandlerResult<()> {
        let kind = message.kind();
        if !self.message_kinds().contains(&kind) {
            return Err(HandlerError::unsupported(self.name(), kind));
        }
        self.handle(message).await
    }
}

/// Everything a handler needs, shared by all handlers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub queue: Arc<dyn Queue>,
    pub repository: Arc<dyn ExecutionRepository>,
    pub clock: Arc<dyn Clock>,
    pub stage_builders: Arc<StageBuilderRegistry>,
    pub tasks: Arc<TaskResolver>,
    pub exception_handlers: Arc<ExceptionHandlerChain>,
    pub metrics: Arc<dyn QueueMetrics>,
    pub config: Arc<QueueSystemConfig>,
}

impl HandlerContext {
    /// Context with the built-in stage types and tasks, the default exception
    /// handler and default configuration
    pub fn new(queue: Arc<dyn Queue>, repository: Arc<dyn ExecutionRepository>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            queue,
            repository,
            tasks: Arc::new(TaskResolver::with_defaults(clock.clone())),
            clock,
            stage_builders: Arc::new(StageBuilderRegistry::with_defaults()),
            exception_handlers: Arc::new(ExceptionHandlerChain::with_default()),
            metrics: Arc::new(NoopQueueMetrics),
            config: Arc::new(QueueSystemConfig::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stage_builders(mut self, stage_builders: StageBuilderRegistry) -> Self {
        self.stage_builders = Arc::new(stage_builders);
        self
    }

    pub fn with_tasks(mut self, tasks: TaskResolver) -> Self {
        self.tasks = Arc::new(tasks);
        self
    }

    pub fn with_exception_handlers(mut self, handlers: ExceptionHandlerChain) -> Self {
        self.exception_handlers = Arc::new(handlers);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: Arc<QueueSystemConfig>) -> Self {
        self.config = config;
        self
    }

    /// Delay before re-checking a parent whose synthetic children are still running
    pub fn retry_delay(&self) -> Duration {
        self.config.retry.handler_retry_delay()
    }

    pub async fn push(&self, message: Message) -> HandlerResult<()> {
        self.queue.push(message, Duration::ZERO).await?;
        Ok(())
    }

    pub async fn push_delayed(&self, message: Message, delay: Duration) -> HandlerResult<()> {
        self.queue.push(message, delay).await?;
        Ok(())
    }

    pub async fn resolve_execution(&self, address: &ExecutionAddress) -> HandlerResult<Option<Execution>> {
        match self
            .repository
            .retrieve(address.execution_type, &address.execution_id)
            .await
        {
            Ok(execution) => Ok(Some(execution)),
            Err(e) if e.is_not_found() => {
                warn!(
                    execution_type = %address.execution_type,
                    execution_id = %address.execution_id,
                    "Execution not found"
                );
                self.push(Message::InvalidExecutionId(address.clone())).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn resolve_stage(&self, address: &StageAddress) -> HandlerResult<Option<(Execution, Stage)>> {
        let Some(execution) = self.resolve_execution(&address.execution).await? else {
            return Ok(None);
        };
        match execution.stage_by_id(&address.stage_id).cloned() {
            Some(stage) => Ok(Some((execution, stage))),
            None => {
                warn!(
                    execution_id = %address.execution.execution_id,
                    stage_id = %address.stage_id,
                    "Stage not found"
                );
                self.push(Message::InvalidStageId(address.clone())).await?;
                Ok(None)
            }
        }
    }

    pub async fn resolve_task(&self, address: &TaskAddress) -> HandlerResult<Option<(Execution, Stage, Task)>> {
        let Some((execution, stage)) = self.resolve_stage(&address.stage).await? else {
            return Ok(None);
        };
        match stage.task_by_id(&address.task_id).cloned() {
            Some(task) => Ok(Some((execution, stage, task))),
            None => {
                warn!(
                    execution_id = %address.execution().execution_id,
                    stage_id = %address.stage.stage_id,
                    task_id = %address.task_id,
                    "Task not found"
                );
                self.push(Message::InvalidTaskId(address.clone())).await?;
                Ok(None)
            }
        }
    }

    pub async fn store_stage(&self, execution: &Execution, stage: &Stage) -> HandlerResult<()> {
        self.repository
            .store_stage(execution.execution_type, &execution.id, stage)
            .await?;
        Ok(())
    }

    /// Kick off a freshly planned stage: its first before stages, else its
    /// tasks or after stages
    pub async fn start_stage_work(&self, execution: &Execution, stage: &Stage) -> HandlerResult<()> {
        let address = StageAddress::of(execution, stage);
        let before = execution.first_before_stages(&stage.id);
        if before.is_empty() {
            return self.start_tasks_or_after(execution, stage).await;
        }
        for child in before {
            self.push(Message::StartStage(address.sibling(&child.id))).await?;
        }
        Ok(())
    }

    /// Continue a stage whose before stages are done: first task, else the
    /// first after stages, else complete it
    pub async fn start_tasks_or_after(&self, execution: &Execution, stage: &Stage) -> HandlerResult<()> {
        let address = StageAddress::of(execution, stage);
        if let Some(task) = stage.first_task() {
            return self.push(Message::StartTask(address.task(&task.id))).await;
        }
        let after: Vec<&Stage> = execution
            .first_after_stages(&stage.id)
            .into_iter()
            .filter(|s| s.status == ExecutionStatus::NotStarted)
            .collect();
        if after.is_empty() {
            return self.push(Message::CompleteStage(address)).await;
        }
        for child in after {
            self.push(Message::StartStage(address.sibling(&child.id))).await?;
        }
        Ok(())
    }

    /// Move on from a successfully finished stage: its downstream stages, else
    /// its parent, else the execution
    pub async fn start_next(&self, execution: &Execution, stage: &Stage) -> HandlerResult<()> {
        let address = StageAddress::of(execution, stage);
        let downstream = execution.downstream_stages(stage);
        if !downstream.is_empty() {
            for next in downstream {
                self.push(Message::StartStage(address.sibling(&next.id))).await?;
            }
            return Ok(());
        }
        match (&stage.parent_stage_id, stage.synthetic_stage_owner) {
            (Some(parent_id), Some(phase)) => {
                debug!(stage_id = %stage.id, parent_id = %parent_id, "Continuing parent stage");
                let message = Message::ContinueParentStage(ContinueParentStage {
                    stage: address.sibling(parent_id),
                    phase,
                });
                self.queue.ensure(message, Duration::ZERO).await?;
                Ok(())
            }
            _ => self.push(Message::CompleteExecution(address.execution)).await,
        }
    }

    /// Cancel a failed stage and hand the failure to its parent or the execution
    pub async fn propagate_failure(&self, execution: &Execution, stage: &Stage) -> HandlerResult<()> {
        let address = StageAddress::of(execution, stage);
        self.push(Message::CancelStage(address.clone())).await?;
        match &stage.parent_stage_id {
            Some(parent_id) => self.push(Message::CompleteStage(address.sibling(parent_id))).await,
            None => self.push(Message::CompleteExecution(address.execution)).await,
        }
    }

    /// Let queued executions of the same pipeline config start
    pub async fn start_waiting(&self, execution: &Execution) -> HandlerResult<()> {
        if let Some(config_id) = &execution.pipeline_config_id {
            self.push(Message::StartWaitingExecutions(StartWaitingExecutions {
                pipeline_config_id: config_id.clone(),
                purge_queue: !execution.keep_waiting_pipelines,
            }))
            .await?;
        }
        Ok(())
    }
}

/// One handler per message kind, all sharing `ctx`
pub fn all_handlers(ctx: &HandlerContext) -> Vec<Arc<dyn MessageHandler>> {
    vec![
        Arc::new(StartExecutionHandler::new(ctx.clone())),
        Arc::new(RescheduleExecutionHandler::new(ctx.clone())),
        Arc::new(CompleteExecutionHandler::new(ctx.clone())),
        Arc::new(ResumeExecutionHandler::new(ctx.clone())),
        Arc::new(CancelExecutionHandler::new(ctx.clone())),
        Arc::new(StartWaitingExecutionsHandler::new(ctx.clone())),
        Arc::new(StartStageHandler::new(ctx.clone())),
        Arc::new(CompleteStageHandler::new(ctx.clone())),
        Arc::new(ContinueParentStageHandler::new(ctx.clone())),
        Arc::new(SkipStageHandler::new(ctx.clone())),
        Arc::new(AbortStageHandler::new(ctx.clone())),
        Arc::new(PauseStageHandler::new(ctx.clone())),
        Arc::new(ResumeStageHandler::new(ctx.clone())),
        Arc::new(RestartStageHandler::new(ctx.clone())),
        Arc::new(CancelStageHandler::new(ctx.clone())),
        Arc::new(StartTaskHandler::new(ctx.clone())),
        Arc::new(CompleteTaskHandler::new(ctx.clone())),
        Arc::new(PauseTaskHandler::new(ctx.clone())),
        Arc::new(ResumeTaskHandler::new(ctx.clone())),
        Arc::new(RunTaskHandler::new(ctx.clone())),
        Arc::new(ConfigurationErrorHandler::new(ctx.clone())),
    ]
}


#[cfg(test)]
mod tests {
    use super::test_support::{drain, fixture};
    use super::*;
    use crate::models::ExecutionType;

    #[derive(Debug)]
    struct OnlyStartStage;

    #[async_trait]
    impl MessageHandler for OnlyStartStage {
        fn name(&self) -> &'static str {
            "OnlyStartStage"
        }

        fn message_kinds(&self) -> &'static [MessageKind] {
            &[MessageKind::StartStage]
        }

        async fn handle(&self, _message: &Message) -> HandlerResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_invoke_rejects_undeclared_kinds() {
        let address = ExecutionAddress::new(ExecutionType::Pipeline, "e1", "app");
        let err = OnlyStartStage
            .invoke(&Message::CompleteExecution(address.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::UnsupportedMessageType {
                kind: MessageKind::CompleteExecution,
                ..
            }
        ));
        assert!(OnlyStartStage
            .invoke(&Message::StartStage(address.stage("s1")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_execution_emits_single_invalid_id() {
        let f = fixture();
        let address = ExecutionAddress::new(ExecutionType::Pipeline, "missing", "app");

        let resolved = f
            .ctx
            .resolve_task(&address.stage("s1").task("1"))
            .await
            .unwrap();
        assert!(resolved.is_none());
        assert_eq!(drain(&f.queue).await, vec![Message::InvalidExecutionId(address)]);
        assert_eq!(f.repository.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_stage_and_task_are_reported() {
        let f = fixture();
        let mut stage = Stage::new("wait", "wait", "1").with_id("s1");
        stage.tasks.push(Task::new("1", "wait", "WaitTask"));
        let execution = Execution::pipeline("app").with_id("e1").with_stage(stage);
        f.repository.store(&execution).await.unwrap();
        let writes = f.repository.write_count();
        let address = ExecutionAddress::from(&execution);

        assert!(f.ctx.resolve_stage(&address.stage("nope")).await.unwrap().is_none());
        assert!(f
            .ctx
            .resolve_task(&address.stage("s1").task("9"))
            .await
            .unwrap()
            .is_none());
        assert!(f
            .ctx
            .resolve_task(&address.stage("s1").task("1"))
            .await
            .unwrap()
            .is_some());

        assert_eq!(
            drain(&f.queue).await,
            vec![
                Message::InvalidStageId(address.stage("nope")),
                Message::InvalidTaskId(address.stage("s1").task("9")),
            ]
        );
        assert_eq!(f.repository.write_count(), writes);
    }

    #[test]
    fn test_every_kind_has_exactly_one_handler() {
        let f = fixture();
        let handlers = all_handlers(&f.ctx);
        let mut kinds: Vec<MessageKind> = handlers
            .iter()
            .flat_map(|h| h.message_kinds().iter().copied())
            .collect();
        let total = kinds.len();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), total);
        assert_eq!(total, 25);
    }
}
