//! Handlers for messages addressed to a whole execution.

use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::constants::ExecutionStatus;
use crate::messaging::{
    CancelExecution, ExecutionAddress, Message, MessageKind, RunTask, StageAddress,
    StartWaitingExecutions,
};
use crate::models::{assign_phases, Execution, Stage};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SUPERSEDED_REASON: &str =
    "Canceled because a newer queued execution of the same pipeline superseded it";

#[derive(Debug)]
pub struct StartExecutionHandler {
    ctx: HandlerContext,
}

impl StartExecutionHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn fail(&self, execution: &Execution) -> HandlerResult<()> {
        self.ctx
            .repository
            .update_status(execution.execution_type, &execution.id, ExecutionStatus::Terminal)
            .await?;
        self.ctx.start_waiting(execution).await
    }
}

#[async_trait]
impl MessageHandler for StartExecutionHandler {
    fn name(&self) -> &'static str {
        "StartExecutionHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::StartExecution]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::StartExecution(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some(execution) = self.ctx.resolve_execution(address).await? else {
            return Ok(());
        };

        if execution.status != ExecutionStatus::NotStarted {
            debug!(execution_id = %execution.id, status = %execution.status, "Execution already started");
            return Ok(());
        }

        if execution.canceled {
            info!(execution_id = %execution.id, "🛑 Execution canceled before it started");
            self.ctx
                .repository
                .update_status(execution.execution_type, &execution.id, ExecutionStatus::Canceled)
                .await?;
            return self.ctx.start_waiting(&execution).await;
        }

        if execution.limit_concurrent {
            if let Some(config_id) = &execution.pipeline_config_id {
                if self.ctx.repository.has_running(config_id, &execution.id).await? {
                    info!(
                        execution_id = %execution.id,
                        pipeline_config_id = %config_id,
                        "⏳ Queuing execution behind a running execution of the same pipeline"
                    );
                    return Ok(());
                }
            }
        }

        let top_level: Vec<Stage> = execution.top_level_stages().into_iter().cloned().collect();
        if let Err(e) = assign_phases(&top_level) {
            error!(execution_id = %execution.id, error = %e, "Invalid stage graph");
            return self.fail(&execution).await;
        }

        let initial = execution.initial_stages();
        if initial.is_empty() {
            warn!(execution_id = %execution.id, "Execution has no initial stages");
            return self.fail(&execution).await;
        }

        self.ctx
            .repository
            .update_status(execution.execution_type, &execution.id, ExecutionStatus::Running)
            .await?;
        for stage in initial {
            self.ctx.push(Message::StartStage(address.stage(&stage.id))).await?;
        }
        info!(
            execution_id = %execution.id,
            application = %execution.application,
            "🚀 Execution started"
        );
        Ok(())
    }
}

/// Brings every in-flight `RunTask` of an execution forward to now
#[derive(Debug)]
pub struct RescheduleExecutionHandler {
    ctx: HandlerContext,
}

impl RescheduleExecutionHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for RescheduleExecutionHandler {
    fn name(&self) -> &'static str {
        "RescheduleExecutionHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::RescheduleExecution]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::RescheduleExecution(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some(execution) = self.ctx.resolve_execution(address).await? else {
            return Ok(());
        };

        let running_stages = execution
            .stages
            .iter()
            .filter(|s| s.status == ExecutionStatus::Running);
        for stage in running_stages {
            let stage_address = StageAddress::of(&execution, stage);
            for task in stage.tasks.iter().filter(|t| t.status == ExecutionStatus::Running) {
                let run = Message::RunTask(RunTask {
                    task: stage_address.task(&task.id),
                    task_type: task.implementing_class.clone(),
                });
                self.ctx.queue.reschedule(&run, Duration::ZERO).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CompleteExecutionHandler {
    ctx: HandlerContext,
}

impl CompleteExecutionHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for CompleteExecutionHandler {
    fn name(&self) -> &'static str {
        "CompleteExecutionHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::CompleteExecution]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::CompleteExecution(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some(execution) = self.ctx.resolve_execution(address).await? else {
            return Ok(());
        };

        if execution.status.is_complete() {
            debug!(execution_id = %execution.id, status = %execution.status, "Execution already complete");
            return Ok(());
        }

        let status = execution.execution_determine_status();
        if status == ExecutionStatus::Running {
            debug!(execution_id = %execution.id, "Execution still has stages in flight");
            return Ok(());
        }

        self.ctx
            .repository
            .update_status(execution.execution_type, &execution.id, status)
            .await?;
        if status != ExecutionStatus::Succeeded {
            for stage in execution
                .top_level_stages()
                .into_iter()
                .filter(|s| s.status == ExecutionStatus::Running)
            {
                self.ctx.push(Message::CancelStage(address.stage(&stage.id))).await?;
            }
        }
        info!(execution_id = %execution.id, status = %status, "🏁 Execution complete");

        self.ctx.start_waiting(&execution).await
    }
}

#[derive(Debug)]
pub struct ResumeExecutionHandler {
    ctx: HandlerContext,
}

impl ResumeExecutionHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for ResumeExecutionHandler {
    fn name(&self) -> &'static str {
        "ResumeExecutionHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::ResumeExecution]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::ResumeExecution(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some(execution) = self.ctx.resolve_execution(address).await? else {
            return Ok(());
        };
        if execution.status != ExecutionStatus::Paused {
            debug!(execution_id = %execution.id, status = %execution.status, "Execution not paused");
            return Ok(());
        }

        self.ctx
            .repository
            .resume(execution.execution_type, &execution.id, None)
            .await?;
        for stage in execution
            .stages
            .iter()
            .filter(|s| s.status == ExecutionStatus::Paused)
        {
            self.ctx.push(Message::ResumeStage(address.stage(&stage.id))).await?;
        }
        info!(execution_id = %execution.id, "▶️ Execution resumed");
        Ok(())
    }
}

#[derive(Debug)]
pub struct CancelExecutionHandler {
    ctx: HandlerContext,
}

impl CancelExecutionHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for CancelExecutionHandler {
    fn name(&self) -> &'static str {
        "CancelExecutionHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::CancelExecution]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::CancelExecution(CancelExecution {
            execution: address,
            user,
            reason,
        }) = message
        else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some(execution) = self.ctx.resolve_execution(address).await? else {
            return Ok(());
        };
        if execution.status.is_complete() {
            debug!(execution_id = %execution.id, status = %execution.status, "Execution already complete");
            return Ok(());
        }

        self.ctx
            .repository
            .cancel(
                execution.execution_type,
                &execution.id,
                user.as_deref(),
                reason.as_deref(),
            )
            .await?;

        if execution.status == ExecutionStatus::Paused {
            self.ctx.push(Message::ResumeExecution(address.clone())).await?;
        }
        self.ctx.push(Message::RescheduleExecution(address.clone())).await?;
        if !execution
            .stages
            .iter()
            .any(|s| s.status == ExecutionStatus::Running)
        {
            self.ctx.push(Message::CompleteExecution(address.clone())).await?;
        }

        info!(
            execution_id = %execution.id,
            user = user.as_deref().unwrap_or("anonymous"),
            "🛑 Execution canceled"
        );
        Ok(())
    }
}

/// Starts executions that were held back by `limit_concurrent`
#[derive(Debug)]
pub struct StartWaitingExecutionsHandler {
    ctx: HandlerContext,
}

impl StartWaitingExecutionsHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for StartWaitingExecutionsHandler {
    fn name(&self) -> &'static str {
        "StartWaitingExecutionsHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::StartWaitingExecutions]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::StartWaitingExecutions(StartWaitingExecutions {
            pipeline_config_id,
            purge_queue,
        }) = message
        else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };

        let waiting: Vec<Execution> = self
            .ctx
            .repository
            .retrieve_by_config_id(pipeline_config_id)
            .await?
            .into_iter()
            .filter(|e| e.status == ExecutionStatus::NotStarted && !e.canceled)
            .collect();

        let Some((oldest, _)) = waiting.split_first() else {
            debug!(pipeline_config_id = %pipeline_config_id, "No waiting executions");
            return Ok(());
        };

        if !purge_queue {
            info!(pipeline_config_id = %pipeline_config_id, execution_id = %oldest.id, "Starting oldest waiting execution");
            return self
                .ctx
                .push(Message::StartExecution(ExecutionAddress::from(oldest)))
                .await;
        }

        let Some((newest, superseded)) = waiting.split_last() else {
            return Ok(());
        };
        info!(
            pipeline_config_id = %pipeline_config_id,
            execution_id = %newest.id,
            purged = superseded.len(),
            "Starting newest waiting execution"
        );
        self.ctx
            .push(Message::StartExecution(ExecutionAddress::from(newest)))
            .await?;
        for execution in superseded {
            self.ctx
                .push(Message::CancelExecution(CancelExecution {
                    execution: ExecutionAddress::from(execution),
                    user: Some("system".to_string()),
                    reason: Some(SUPERSEDED_REASON.to_string()),
                }))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{drain, fixture};
    use crate::repository::ExecutionRepository;
    use crate::models::ExecutionType;
    use chrono::Duration as ChronoDuration;

    fn two_stage_execution() -> Execution {
        Execution::pipeline("app")
            .with_id("e1")
            .with_stage(Stage::new("wait", "a", "1").with_id("a"))
            .with_stage(Stage::new("wait", "b", "2").with_id("b").with_requisites(["1"]))
    }

    #[tokio::test]
    async fn test_start_execution_starts_initial_stages() {
        let f = fixture();
        let execution = two_stage_execution();
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution);

        StartExecutionHandler::new(f.ctx.clone())
            .handle(&Message::StartExecution(address.clone()))
            .await
            .unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
        assert!(stored.start_time.is_some());
        assert_eq!(drain(&f.queue).await, vec![Message::StartStage(address.stage("a"))]);
    }

    #[tokio::test]
    async fn test_redelivered_start_execution_starts_stages_once() {
        let f = fixture();
        let execution = two_stage_execution();
        f.repository.store(&execution).await.unwrap();
        let message = Message::StartExecution(ExecutionAddress::from(&execution));
        let handler = StartExecutionHandler::new(f.ctx.clone());

        handler.handle(&message).await.unwrap();
        assert_eq!(drain(&f.queue).await.len(), 1);
        handler.handle(&message).await.unwrap();

        assert!(drain(&f.queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_complete_execution_changes_nothing() {
        let f = fixture();
        let mut execution = two_stage_execution();
        execution.status = ExecutionStatus::Succeeded;
        for stage in &mut execution.stages {
            stage.status = ExecutionStatus::Succeeded;
        }
        f.repository.store(&execution).await.unwrap();
        let writes = f.repository.write_count();

        CompleteExecutionHandler::new(f.ctx.clone())
            .handle(&Message::CompleteExecution(ExecutionAddress::from(&execution)))
            .await
            .unwrap();

        assert_eq!(f.repository.write_count(), writes);
        assert!(drain(&f.queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_start_execution_rejects_cyclic_graph() {
        let f = fixture();
        let execution = Execution::pipeline("app")
            .with_id("e1")
            .with_stage(Stage::new("wait", "root", "0"))
            .with_stage(Stage::new("wait", "a", "1").with_requisites(["2"]))
            .with_stage(Stage::new("wait", "b", "2").with_requisites(["1"]));
        f.repository.store(&execution).await.unwrap();

        StartExecutionHandler::new(f.ctx.clone())
            .handle(&Message::StartExecution(ExecutionAddress::from(&execution)))
            .await
            .unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Terminal);
        assert!(drain(&f.queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_limit_concurrent_leaves_execution_waiting() {
        let f = fixture();
        let mut running = two_stage_execution().with_pipeline_config("cfg", true);
        running.status = ExecutionStatus::Running;
        let waiting = Execution::pipeline("app")
            .with_id("e2")
            .with_stage(Stage::new("wait", "a", "1"))
            .with_pipeline_config("cfg", true);
        f.repository.store(&running).await.unwrap();
        f.repository.store(&waiting).await.unwrap();

        StartExecutionHandler::new(f.ctx.clone())
            .handle(&Message::StartExecution(ExecutionAddress::from(&waiting)))
            .await
            .unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e2").await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::NotStarted);
        assert!(drain(&f.queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_complete_execution_waits_for_running_stages() {
        let f = fixture();
        let mut execution = two_stage_execution();
        execution.status = ExecutionStatus::Running;
        execution.stages[0].status = ExecutionStatus::Succeeded;
        execution.stages[1].status = ExecutionStatus::Running;
        f.repository.store(&execution).await.unwrap();
        let handler = CompleteExecutionHandler::new(f.ctx.clone());
        let message = Message::CompleteExecution(ExecutionAddress::from(&execution));

        handler.handle(&message).await.unwrap();
        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);

        f.repository
            .store_stage(ExecutionType::Pipeline, "e1", &{
                let mut b = stored.stages[1].clone();
                b.status = ExecutionStatus::Succeeded;
                b
            })
            .await
            .unwrap();
        handler.handle(&message).await.unwrap();
        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn test_terminal_execution_cancels_running_stages_and_releases_queue() {
        let f = fixture();
        let mut execution = Execution::pipeline("app")
            .with_id("e1")
            .with_stage(Stage::new("wait", "a", "1").with_id("a"))
            .with_stage(Stage::new("wait", "b", "2").with_id("b"))
            .with_pipeline_config("cfg", true);
        execution.status = ExecutionStatus::Running;
        execution.stages[0].status = ExecutionStatus::Terminal;
        execution.stages[1].status = ExecutionStatus::Running;
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution);

        CompleteExecutionHandler::new(f.ctx.clone())
            .handle(&Message::CompleteExecution(address.clone()))
            .await
            .unwrap();

        assert_eq!(
            drain(&f.queue).await,
            vec![
                Message::CancelStage(address.stage("b")),
                Message::StartWaitingExecutions(StartWaitingExecutions {
                    pipeline_config_id: "cfg".into(),
                    purge_queue: true,
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_not_started_execution_completes_it() {
        let f = fixture();
        let execution = two_stage_execution();
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution);

        CancelExecutionHandler::new(f.ctx.clone())
            .handle(&Message::CancelExecution(CancelExecution {
                execution: address.clone(),
                user: Some("alice".into()),
                reason: Some("no longer needed".into()),
            }))
            .await
            .unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert!(stored.canceled);
        assert_eq!(stored.canceled_by.as_deref(), Some("alice"));
        assert_eq!(
            drain(&f.queue).await,
            vec![
                Message::RescheduleExecution(address.clone()),
                Message::CompleteExecution(address),
            ]
        );
    }

    #[tokio::test]
    async fn test_purge_starts_newest_and_cancels_the_rest() {
        let f = fixture();
        let base = chrono::Utc::now();
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            let mut execution = Execution::pipeline("app")
                .with_id(*id)
                .with_stage(Stage::new("wait", "a", "1"))
                .with_pipeline_config("cfg", true);
            execution.build_time = Some(base + ChronoDuration::seconds(i as i64));
            f.repository.store(&execution).await.unwrap();
        }

        StartWaitingExecutionsHandler::new(f.ctx.clone())
            .handle(&Message::StartWaitingExecutions(StartWaitingExecutions {
                pipeline_config_id: "cfg".into(),
                purge_queue: true,
            }))
            .await
            .unwrap();

        let messages = drain(&f.queue).await;
        let address = |id: &str| ExecutionAddress::new(ExecutionType::Pipeline, id, "app");
        assert_eq!(messages[0], Message::StartExecution(address("new")));
        let canceled: Vec<&str> = messages[1..]
            .iter()
            .filter_map(|m| match m {
                Message::CancelExecution(c) => Some(c.execution.execution_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(canceled, vec!["old", "mid"]);
    }

    #[tokio::test]
    async fn test_without_purge_starts_oldest() {
        let f = fixture();
        let base = chrono::Utc::now();
        for (i, id) in ["old", "new"].iter().enumerate() {
            let mut execution = Execution::pipeline("app")
                .with_id(*id)
                .with_stage(Stage::new("wait", "a", "1"))
                .with_pipeline_config("cfg", true);
            execution.build_time = Some(base + ChronoDuration::seconds(i as i64));
            f.repository.store(&execution).await.unwrap();
        }

        StartWaitingExecutionsHandler::new(f.ctx.clone())
            .handle(&Message::StartWaitingExecutions(StartWaitingExecutions {
                pipeline_config_id: "cfg".into(),
                purge_queue: false,
            }))
            .await
            .unwrap();

        assert_eq!(
            drain(&f.queue).await,
            vec![Message::StartExecution(ExecutionAddress::new(
                ExecutionType::Pipeline,
                "old",
                "app"
            ))]
        );
    }
}
