//! Handlers for messages addressed to a stage.

use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::constants::{context_keys, status_groups, ExecutionStatus};
use crate::exceptions::ExceptionDetails;
use crate::messaging::{ContinueParentStage, Message, MessageKind, RestartStage, StageAddress};
use crate::models::{Execution, Stage, SyntheticStageOwner};
use crate::pipeline::plan_stage;
use crate::repository::RepositoryError;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

fn is_active(stage: &Stage) -> bool {
    matches!(stage.status, ExecutionStatus::Running | ExecutionStatus::NotStarted)
}

#[derive(Debug)]
pub struct StartStageHandler {
    ctx: HandlerContext,
}

impl StartStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn start(&self, execution: Execution, stage: Stage) -> HandlerResult<()> {
        let now = self.ctx.clock.now();
        let mut plan = match plan_stage(&execution, &stage.id, &self.ctx.stage_builders) {
            Ok(plan) => plan,
            Err(e) => {
                error!(
                    execution_id = %execution.id,
                    stage_id = %stage.id,
                    stage_type = %stage.stage_type,
                    error = %e,
                    "Stage planning failed"
                );
                let details = ExceptionDetails {
                    should_retry: false,
                    error_type: "planning".to_string(),
                    message: e.to_string(),
                    details: Value::Null,
                };
                let mut failed = stage;
                failed.status = ExecutionStatus::Running;
                failed.start_time = Some(now);
                failed
                    .context
                    .insert(context_keys::BEFORE_STAGE_PLANNING_FAILED.to_string(), Value::Bool(true));
                failed.context.insert(
                    context_keys::EXCEPTION.to_string(),
                    serde_json::to_value(&details).unwrap_or_default(),
                );
                self.ctx.store_stage(&execution, &failed).await?;
                return self
                    .ctx
                    .push(Message::CompleteStage(StageAddress::of(&execution, &failed)))
                    .await;
            }
        };

        plan.stage.status = ExecutionStatus::Running;
        plan.stage.start_time = Some(now);
        for (child, position) in plan.placements(&stage.id) {
            self.ctx
                .repository
                .add_stage(execution.execution_type, &execution.id, &child, position)
                .await?;
        }
        self.ctx.store_stage(&execution, &plan.stage).await?;
        debug!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            tasks = plan.stage.tasks.len(),
            synthetic = plan.synthetic_count(),
            "Stage planned"
        );

        let mut planned = execution;
        plan.apply(&mut planned);
        let Some(started) = planned.stage_by_id(&stage.id) else {
            return Err(HandlerError::internal(format!("planned stage {} vanished", stage.id)));
        };
        self.ctx.start_stage_work(&planned, started).await?;
        info!(
            execution_id = %planned.id,
            stage_id = %stage.id,
            stage_type = %stage.stage_type,
            "▶️ Stage started"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for StartStageHandler {
    fn name(&self) -> &'static str {
        "StartStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::StartStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::StartStage(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };

        if execution.any_upstream_stages_failed(&stage) {
            warn!(execution_id = %execution.id, stage_id = %stage.id, "Upstream stage failed");
            return self
                .ctx
                .push(Message::CompleteExecution(address.execution.clone()))
                .await;
        }
        if !execution.all_upstream_stages_complete(&stage) {
            debug!(execution_id = %execution.id, stage_id = %stage.id, "Upstream stages still running");
            return Ok(());
        }
        if stage.status != ExecutionStatus::NotStarted {
            debug!(stage_id = %stage.id, status = %stage.status, "Stage already started");
            return Ok(());
        }
        self.start(execution, stage).await
    }
}

#[derive(Debug)]
pub struct CompleteStageHandler {
    ctx: HandlerContext,
}

impl CompleteStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for CompleteStageHandler {
    fn name(&self) -> &'static str {
        "CompleteStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::CompleteStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::CompleteStage(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if !is_active(&stage) {
            debug!(stage_id = %stage.id, status = %stage.status, "Stage already complete");
            return Ok(());
        }

        let status = execution.stage_determine_status(&stage);
        if status == ExecutionStatus::Running {
            debug!(stage_id = %stage.id, "Stage still has work in flight");
            return Ok(());
        }

        if status_groups::is_completed_ok(status) {
            let pending_after: Vec<&Stage> = execution
                .first_after_stages(&stage.id)
                .into_iter()
                .filter(|s| s.status == ExecutionStatus::NotStarted)
                .collect();
            if !pending_after.is_empty() {
                for child in pending_after {
                    self.ctx.push(Message::StartStage(address.sibling(&child.id))).await?;
                }
                return Ok(());
            }
        }

        let mut completed = stage;
        completed.status = status;
        completed.end_time = Some(self.ctx.clock.now());
        self.ctx.store_stage(&execution, &completed).await?;
        info!(
            execution_id = %execution.id,
            stage_id = %completed.id,
            status = %status,
            "✅ Stage complete"
        );

        if status_groups::is_completed_ok(status) {
            self.ctx.start_next(&execution, &completed).await
        } else {
            self.ctx.propagate_failure(&execution, &completed).await
        }
    }
}

/// Re-checks a parent stage once one of its synthetic children finished
#[derive(Debug)]
pub struct ContinueParentStageHandler {
    ctx: HandlerContext,
}

impl ContinueParentStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for ContinueParentStageHandler {
    fn name(&self) -> &'static str {
        "ContinueParentStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::ContinueParentStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::ContinueParentStage(ContinueParentStage { stage: address, phase }) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if stage.status != ExecutionStatus::Running {
            debug!(stage_id = %stage.id, status = %stage.status, "Parent stage not running");
            return Ok(());
        }

        match phase {
            SyntheticStageOwner::StageBefore => {
                if execution.all_before_stages_successful(&stage.id) {
                    self.ctx.start_tasks_or_after(&execution, &stage).await
                } else if execution.any_before_stages_failed(&stage.id) {
                    self.ctx.push(Message::CompleteStage(address.clone())).await
                } else {
                    debug!(stage_id = %stage.id, "Before stages still running, re-checking later");
                    self.ctx
                        .push_delayed(message.clone(), self.ctx.retry_delay())
                        .await
                }
            }
            SyntheticStageOwner::StageAfter => {
                if execution.all_after_stages_complete(&stage.id) {
                    self.ctx.push(Message::CompleteStage(address.clone())).await
                } else {
                    debug!(stage_id = %stage.id, "After stages still running, re-checking later");
                    self.ctx
                        .push_delayed(message.clone(), self.ctx.retry_delay())
                        .await
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct SkipStageHandler {
    ctx: HandlerContext,
}

impl SkipStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for SkipStageHandler {
    fn name(&self) -> &'static str {
        "SkipStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::SkipStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::SkipStage(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if !is_active(&stage) {
            debug!(stage_id = %stage.id, status = %stage.status, "Stage already complete");
            return Ok(());
        }

        let now = self.ctx.clock.now();
        for child in execution.descendant_stages(&stage.id) {
            if child.status.is_complete() {
                continue;
            }
            let mut skipped = child.clone();
            skipped.status = ExecutionStatus::Skipped;
            skipped.end_time = Some(now);
            self.ctx.store_stage(&execution, &skipped).await?;
        }

        let mut skipped = stage;
        skipped.status = ExecutionStatus::Skipped;
        skipped.end_time = Some(now);
        self.ctx.store_stage(&execution, &skipped).await?;
        info!(execution_id = %execution.id, stage_id = %skipped.id, "⏭️ Stage skipped");

        self.ctx.start_next(&execution, &skipped).await
    }
}

#[derive(Debug)]
pub struct AbortStageHandler {
    ctx: HandlerContext,
}

impl AbortStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for AbortStageHandler {
    fn name(&self) -> &'static str {
        "AbortStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::AbortStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::AbortStage(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if !is_active(&stage) {
            debug!(stage_id = %stage.id, status = %stage.status, "Stage already complete");
            return Ok(());
        }

        let mut aborted = stage;
        aborted.status = ExecutionStatus::Terminal;
        aborted.end_time = Some(self.ctx.clock.now());
        self.ctx.store_stage(&execution, &aborted).await?;
        warn!(execution_id = %execution.id, stage_id = %aborted.id, "Stage aborted");

        self.ctx.propagate_failure(&execution, &aborted).await
    }
}

#[derive(Debug)]
pub struct PauseStageHandler {
    ctx: HandlerContext,
}

impl PauseStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for PauseStageHandler {
    fn name(&self) -> &'static str {
        "PauseStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::PauseStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::PauseStage(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if stage.status != ExecutionStatus::Running {
            debug!(stage_id = %stage.id, status = %stage.status, "Stage not running");
            return Ok(());
        }

        let mut paused = stage;
        paused.status = ExecutionStatus::Paused;
        self.ctx.store_stage(&execution, &paused).await?;
        debug!(execution_id = %execution.id, stage_id = %paused.id, "⏸️ Stage paused");

        if let Some(parent_id) = &paused.parent_stage_id {
            self.ctx.push(Message::PauseStage(address.sibling(parent_id))).await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ResumeStageHandler {
    ctx: HandlerContext,
}

impl ResumeStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for ResumeStageHandler {
    fn name(&self) -> &'static str {
        "ResumeStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::ResumeStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::ResumeStage(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if stage.status != ExecutionStatus::Paused {
            debug!(stage_id = %stage.id, status = %stage.status, "Stage not paused");
            return Ok(());
        }

        let mut resumed = stage;
        resumed.status = ExecutionStatus::Running;
        self.ctx.store_stage(&execution, &resumed).await?;

        for task in resumed
            .tasks
            .iter()
            .filter(|t| t.status == ExecutionStatus::Paused)
        {
            self.ctx.push(Message::ResumeTask(address.task(&task.id))).await?;
        }
        if let Some(parent) = execution.parent(&resumed) {
            if parent.status == ExecutionStatus::Paused {
                self.ctx.push(Message::ResumeStage(address.sibling(&parent.id))).await?;
            }
        }
        Ok(())
    }
}

/// Re-runs a completed stage and everything downstream of it
#[derive(Debug)]
pub struct RestartStageHandler {
    ctx: HandlerContext,
}

impl RestartStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn remove_synthetic_children(&self, execution: &Execution, stage: &Stage) -> HandlerResult<()> {
        for child in execution.descendant_stages(&stage.id) {
            match self
                .ctx
                .repository
                .remove_stage(execution.execution_type, &execution.id, &child.id)
                .await
            {
                Ok(()) | Err(RepositoryError::StageNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Clear the terminal state of a finished execution so it can run again
    async fn reopen_execution(&self, execution: &Execution) -> HandlerResult<()> {
        let mut current = self
            .ctx
            .repository
            .retrieve(execution.execution_type, &execution.id)
            .await?;
        current.status = ExecutionStatus::Running;
        current.end_time = None;
        current.canceled = false;
        current.canceled_by = None;
        current.cancellation_reason = None;
        self.ctx.repository.store(&current).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RestartStageHandler {
    fn name(&self) -> &'static str {
        "RestartStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::RestartStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::RestartStage(RestartStage { stage: address, user }) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if !stage.status.is_complete() {
            debug!(stage_id = %stage.id, status = %stage.status, "Only completed stages can be restarted");
            return Ok(());
        }

        let mut targets: Vec<Stage> = vec![stage.clone()];
        targets.extend(execution.all_downstream_stages(&stage).into_iter().cloned());

        for target in &targets {
            self.remove_synthetic_children(&execution, target).await?;
        }
        for mut target in targets {
            if target.id == stage.id {
                let details = json!({
                    "restartedBy": user.as_deref().unwrap_or("anonymous"),
                    "restartTime": self.ctx.clock.now_millis(),
                    "previousException": target.context.get(context_keys::EXCEPTION).cloned(),
                });
                target
                    .context
                    .insert(context_keys::RESTART_DETAILS.to_string(), details);
            }
            target.reset();
            self.ctx.store_stage(&execution, &target).await?;
        }

        if execution.status.is_complete() || execution.canceled {
            self.reopen_execution(&execution).await?;
        }

        info!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            user = user.as_deref().unwrap_or("anonymous"),
            "🔁 Stage restarted"
        );
        self.ctx.push(Message::StartStage(address.clone())).await
    }
}

/// Runs cancellation cleanup for a halted stage
#[derive(Debug)]
pub struct CancelStageHandler {
    ctx: HandlerContext,
}

impl CancelStageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for CancelStageHandler {
    fn name(&self) -> &'static str {
        "CancelStageHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::CancelStage]
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        let Message::CancelStage(address) = message else {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        };
        let Some((execution, stage)) = self.ctx.resolve_stage(address).await? else {
            return Ok(());
        };
        if !stage.status.is_halt() {
            debug!(stage_id = %stage.id, status = %stage.status, "Stage not halted, nothing to cancel");
            return Ok(());
        }

        match self.ctx.stage_builders.get(&stage.stage_type) {
            Ok(builder) => {
                if let Some(values) = builder.cancel(&stage) {
                    let mut canceled = stage.clone();
                    canceled.context.extend(values);
                    self.ctx.store_stage(&execution, &canceled).await?;
                }
            }
            Err(e) => debug!(stage_id = %stage.id, error = %e, "No builder to run cancel cleanup"),
        }

        let now = self.ctx.clock.now();
        for child in execution
            .synthetic_stages(&stage.id)
            .into_iter()
            .filter(|s| s.status == ExecutionStatus::Running)
        {
            let mut canceled = child.clone();
            canceled.status = ExecutionStatus::Canceled;
            canceled.end_time = Some(now);
            self.ctx.store_stage(&execution, &canceled).await?;
            self.ctx.push(Message::CancelStage(address.sibling(&child.id))).await?;
        }
        Ok(())
    }
}
