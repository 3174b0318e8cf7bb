//! Handlers for messages addressed to a single task.

use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::constants::ExecutionStatus;
use crate::messaging::{CompleteTask, Message, MessageKind, RunTask, TaskAddress};
use crate::models::{Execution, Stage, Task};
use async_trait::async_trait;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct StartTaskHandler {
    ctx: HandlerContext,
}

impl StartTaskHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for StartTaskHandler {
    fn name(&self) -> &'static str {
        "StartTaskHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::StartTask]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::StartTask(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, mut stage, task)) = self.ctx.resolve_task(address).await? else {
            return Ok(());
        };
        if task.status != ExecutionStatus::NotStarted {
            debug!(stage_id = %stage.id, task_id = %task.id, status = %task.status, "Task already started");
            return Ok(());
        }

        let now = self.ctx.clock.now();
        if let Some(started) = stage.task_by_id_mut(&task.id) {
            started.status = ExecutionStatus::Running;
            started.start_time = Some(now);
        }
        self.ctx.store_stage(&execution, &stage).await?;
        debug!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            task = %task.name,
            "Task started"
        );

        self.ctx
            .push(Message::RunTask(RunTask {
                task: address.clone(),
                task_type: task.implementing_class,
            }))
            .await
    }
}

/// Records a task result and advances to the next task, the after stages or
/// stage completion
#[derive(Debug)]
pub struct CompleteTaskHandler {
    ctx: HandlerContext,
}

impl CompleteTaskHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    /// Restart the loop enclosing `task`, or fail the stage if there is none
    async fn redirect(
        &self,
        execution: &Execution,
        mut stage: Stage,
        task: &Task,
        address: &TaskAddress,
    ) -> HandlerResult<()> {
        let loop_start = stage
            .tasks
            .iter()
            .position(|t| t.id == task.id)
            .and_then(|index| enclosing_loop_start(&stage.tasks, index));

        let Some(start) = loop_start else {
            error!(
                execution_id = %execution.id,
                stage_id = %stage.id,
                task_id = %task.id,
                "Redirect from a task outside of any loop"
            );
            if let Some(failed) = stage.task_by_id_mut(&task.id) {
                failed.status = ExecutionStatus::Terminal;
                failed.end_time = Some(self.ctx.clock.now());
            }
            self.ctx.store_stage(execution, &stage).await?;
            return self.ctx.push(Message::CompleteStage(address.stage.clone())).await;
        };

        let Some(end) = stage.tasks.iter().position(|t| t.id == task.id) else {
            return Ok(());
        };
        for looped in &mut stage.tasks[start..=end] {
            looped.reset();
        }
        let restart_id = stage.tasks[start].id.clone();
        self.ctx.store_stage(execution, &stage).await?;
        debug!(stage_id = %stage.id, from = %task.id, to = %restart_id, "🔁 Redirecting to loop start");
        self.ctx.push(Message::StartTask(address.sibling(restart_id))).await
    }
}

/// Index of the nearest loop start at or before `index`, provided no loop
/// closes in between
fn enclosing_loop_start(tasks: &[Task], index: usize) -> Option<usize> {
    for i in (0..=index).rev() {
        if tasks[i].loop_start {
            return Some(i);
        }
        if i < index && tasks[i].loop_end {
            return None;
        }
    }
    None
}

#[async_trait]
impl MessageHandler for CompleteTaskHandler {
    fn name(&self) -> &'static str {
        "CompleteTaskHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::CompleteTask]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::CompleteTask(CompleteTask {
            task: address,
            status,
            original_status,
        }) = message
        else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let status = *status;
        let Some((execution, mut stage, task)) = self.ctx.resolve_task(address).await? else {
            return Ok(());
        };
        // Only a running task completes. A dead-lettered StartTask or RunTask
        // may terminate a task that never got that far.
        let terminates_unfinished = status == ExecutionStatus::Terminal && !task.status.is_complete();
        if task.status != ExecutionStatus::Running && !terminates_unfinished {
            debug!(task_id = %task.id, task_status = %task.status, status = %status, "Task not running, ignoring completion");
            return Ok(());
        }

        if status == ExecutionStatus::Redirect {
            return self.redirect(&execution, stage, &task, address).await;
        }

        if let Some(completed) = stage.task_by_id_mut(&task.id) {
            completed.status = status;
            completed.end_time = Some(self.ctx.clock.now());
        }
        self.ctx.store_stage(&execution, &stage).await?;
        info!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            task = %task.name,
            status = %status,
            original_status = ?original_status,
            "Task complete"
        );

        if !matches!(status, ExecutionStatus::Succeeded | ExecutionStatus::Skipped) {
            return self.ctx.push(Message::CompleteStage(address.stage.clone())).await;
        }

        if task.stage_end {
            let after: Vec<&Stage> = execution
                .first_after_stages(&stage.id)
                .into_iter()
                .filter(|s| s.status == ExecutionStatus::NotStarted)
                .collect();
            if after.is_empty() {
                return self.ctx.push(Message::CompleteStage(address.stage.clone())).await;
            }
            for child in after {
                self.ctx
                    .push(Message::StartStage(address.stage.sibling(&child.id)))
                    .await?;
            }
            return Ok(());
        }

        match stage.next_task(&task) {
            Some(next) => self.ctx.push(Message::StartTask(address.sibling(&next.id))).await,
            None => {
                error!(stage_id = %stage.id, task_id = %task.id, "No task follows a task that does not end its stage");
                self.ctx.push(Message::NoDownstreamTasks(address.clone())).await
            }
        }
    }
}

#[derive(Debug)]
pub struct PauseTaskHandler {
    ctx: HandlerContext,
}

impl PauseTaskHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for PauseTaskHandler {
    fn name(&self) -> &'static str {
        "PauseTaskHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::PauseTask]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::PauseTask(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, mut stage, task)) = self.ctx.resolve_task(address).await? else {
            return Ok(());
        };
        if task.status != ExecutionStatus::Running {
            debug!(task_id = %task.id, status = %task.status, "Task not running");
            return Ok(());
        }

        if let Some(paused) = stage.task_by_id_mut(&task.id) {
            paused.status = ExecutionStatus::Paused;
        }
        self.ctx.store_stage(&execution, &stage).await?;
        self.ctx.push(Message::PauseStage(address.stage.clone())).await
    }
}

/// Resumes every paused task of the addressed task's stage
#[derive(Debug)]
pub struct ResumeTaskHandler {
    ctx: HandlerContext,
}

impl ResumeTaskHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for ResumeTaskHandler {
    fn name(&self) -> &'static str {
        "ResumeTaskHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::ResumeTask]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::ResumeTask(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, mut stage, _)) = self.ctx.resolve_task(address).await? else {
            return Ok(());
        };

        let mut resumed = Vec::new();
        for task in stage
            .tasks
            .iter_mut()
            .filter(|t| t.status == ExecutionStatus::Paused)
        {
            task.status = ExecutionStatus::Running;
            resumed.push(RunTask {
                task: address.sibling(&task.id),
                task_type: task.implementing_class.clone(),
            });
        }
        if resumed.is_empty() {
            debug!(stage_id = %stage.id, "No paused tasks to resume");
            return Ok(());
        }

        self.ctx.store_stage(&execution, &stage).await?;
        for run in resumed {
            self.ctx.push(Message::RunTask(run)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{drain, fixture};
    use crate::repository::ExecutionRepository;
    use crate::messaging::ExecutionAddress;
    use crate::models::{ExecutionType, SyntheticStageOwner};
    use crate::pipeline::TaskGraph;

    fn looping_stage() -> Stage {
        let mut stage = Stage::new("poll", "poll", "1").with_id("s");
        stage.status = ExecutionStatus::Running;
        stage.tasks = TaskGraph::builder()
            .with_task("prepare", "PrepareTask")
            .with_loop(|g| g.with_task("check", "CheckTask").with_task("wait", "WaitTask"))
            .with_task("finish", "FinishTask")
            .build()
            .flatten();
        stage
    }

    fn execution_with(stage: Stage) -> Execution {
        Execution::pipeline("app").with_id("e1").with_stage(stage)
    }

    fn complete(address: &TaskAddress, status: ExecutionStatus) -> Message {
        Message::CompleteTask(CompleteTask {
            task: address.clone(),
            status,
            original_status: None,
        })
    }

    #[tokio::test]
    async fn test_start_task_runs_it_once() {
        let f = fixture();
        let execution = execution_with(looping_stage());
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("1");
        let handler = StartTaskHandler::new(f.ctx.clone());

        handler.handle(&Message::StartTask(address.clone())).await.unwrap();
        handler.handle(&Message::StartTask(address.clone())).await.unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        let task = stored.stages[0].task_by_id("1").unwrap();
        assert_eq!(task.status, ExecutionStatus::Running);
        assert!(task.start_time.is_some());
        assert_eq!(
            drain(&f.queue).await,
            vec![Message::RunTask(RunTask {
                task: address,
                task_type: "PrepareTask".into(),
            })]
        );
    }

    #[tokio::test]
    async fn test_complete_task_starts_next_task() {
        let f = fixture();
        let mut stage = looping_stage();
        stage.tasks[0].status = ExecutionStatus::Running;
        let execution = execution_with(stage);
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("1");

        CompleteTaskHandler::new(f.ctx.clone())
            .handle(&complete(&address, ExecutionStatus::Succeeded))
            .await
            .unwrap();

        assert_eq!(drain(&f.queue).await, vec![Message::StartTask(address.sibling("2"))]);
    }

    #[tokio::test]
    async fn test_redirect_restarts_enclosing_loop() {
        let f = fixture();
        let mut stage = looping_stage();
        for task in &mut stage.tasks[..2] {
            task.status = ExecutionStatus::Succeeded;
        }
        stage.tasks[2].status = ExecutionStatus::Running;
        let execution = execution_with(stage);
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("3");

        CompleteTaskHandler::new(f.ctx.clone())
            .handle(&complete(&address, ExecutionStatus::Redirect))
            .await
            .unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        let statuses: Vec<ExecutionStatus> = stored.stages[0].tasks.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Succeeded,
                ExecutionStatus::NotStarted,
                ExecutionStatus::NotStarted,
                ExecutionStatus::NotStarted,
            ]
        );
        assert_eq!(drain(&f.queue).await, vec![Message::StartTask(address.sibling("2"))]);
    }

    #[tokio::test]
    async fn test_redelivered_redirect_leaves_restarted_loop_alone() {
        let f = fixture();
        let mut stage = looping_stage();
        for task in &mut stage.tasks[..2] {
            task.status = ExecutionStatus::Succeeded;
        }
        stage.tasks[2].status = ExecutionStatus::Running;
        let execution = execution_with(stage);
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("3");
        let redirect = complete(&address, ExecutionStatus::Redirect);
        let handler = CompleteTaskHandler::new(f.ctx.clone());

        handler.handle(&redirect).await.unwrap();
        StartTaskHandler::new(f.ctx.clone())
            .handle(&Message::StartTask(address.sibling("2")))
            .await
            .unwrap();
        drain(&f.queue).await;

        handler.handle(&redirect).await.unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.stages[0].tasks[1].status, ExecutionStatus::Running);
        assert_eq!(stored.stages[0].tasks[2].status, ExecutionStatus::NotStarted);
        assert!(drain(&f.queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_lettered_start_terminates_unstarted_task() {
        let f = fixture();
        let execution = execution_with(looping_stage());
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("1");

        CompleteTaskHandler::new(f.ctx.clone())
            .handle(&complete(&address, ExecutionStatus::Terminal))
            .await
            .unwrap();

        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.stages[0].tasks[0].status, ExecutionStatus::Terminal);
        assert_eq!(drain(&f.queue).await, vec![Message::CompleteStage(address.stage.clone())]);
    }

    #[tokio::test]
    async fn test_failed_task_completes_stage() {
        let f = fixture();
        let mut stage = looping_stage();
        stage.tasks[1].status = ExecutionStatus::Running;
        let execution = execution_with(stage);
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("2");

        CompleteTaskHandler::new(f.ctx.clone())
            .handle(&complete(&address, ExecutionStatus::Terminal))
            .await
            .unwrap();

        assert_eq!(drain(&f.queue).await, vec![Message::CompleteStage(address.stage.clone())]);
    }

    #[tokio::test]
    async fn test_stage_end_task_starts_after_stages() {
        let f = fixture();
        let mut after = Stage::new("wait", "post", "1>1").with_id("after");
        after.parent_stage_id = Some("s".into());
        after.synthetic_stage_owner = Some(SyntheticStageOwner::StageAfter);
        let mut stage = looping_stage();
        stage.tasks[3].status = ExecutionStatus::Running;
        let execution = execution_with(stage).with_stage(after);
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("4");

        CompleteTaskHandler::new(f.ctx.clone())
            .handle(&complete(&address, ExecutionStatus::Succeeded))
            .await
            .unwrap();

        assert_eq!(
            drain(&f.queue).await,
            vec![Message::StartStage(address.stage.sibling("after"))]
        );
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_ignored() {
        let f = fixture();
        let mut stage = looping_stage();
        stage.tasks[0].status = ExecutionStatus::Succeeded;
        let execution = execution_with(stage);
        f.repository.store(&execution).await.unwrap();
        let writes = f.repository.write_count();
        let address = ExecutionAddress::from(&execution).stage("s").task("1");

        CompleteTaskHandler::new(f.ctx.clone())
            .handle(&complete(&address, ExecutionStatus::Succeeded))
            .await
            .unwrap();

        assert_eq!(f.repository.write_count(), writes);
        assert!(drain(&f.queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_task() {
        let f = fixture();
        let mut stage = looping_stage();
        stage.tasks[0].status = ExecutionStatus::Running;
        let execution = execution_with(stage);
        f.repository.store(&execution).await.unwrap();
        let address = ExecutionAddress::from(&execution).stage("s").task("1");

        PauseTaskHandler::new(f.ctx.clone())
            .handle(&Message::PauseTask(address.clone()))
            .await
            .unwrap();
        assert_eq!(drain(&f.queue).await, vec![Message::PauseStage(address.stage.clone())]);

        ResumeTaskHandler::new(f.ctx.clone())
            .handle(&Message::ResumeTask(address.clone()))
            .await
            .unwrap();
        let stored = f.repository.retrieve(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.stages[0].tasks[0].status, ExecutionStatus::Running);
        assert_eq!(
            drain(&f.queue).await,
            vec![Message::RunTask(RunTask {
                task: address,
                task_type: "PrepareTask".into(),
            })]
        );
    }
}
