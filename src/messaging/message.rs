//! # Queue Messages
//!
//! Every unit of work on the queue is a [`Message`]. Messages are immutable
//! values addressed to an execution, a stage or a task. The address payloads
//! compose: a [`TaskAddress`] flattens a [`StageAddress`], which flattens an
//! [`ExecutionAddress`], so the serialized form carries plain
//! `executionType`/`executionId`/`application`/`stageId`/`taskId` fields next
//! to the `kind` discriminator.
//!
//! ```json
//! {"kind":"startTask","executionType":"PIPELINE","executionId":"01H...","application":"app","stageId":"s1","taskId":"1"}
//! ```

use crate::constants::ExecutionStatus;
use crate::models::{Execution, ExecutionType, Stage, SyntheticStageOwner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// `RunTask` deliveries may take far longer to ack than other messages
pub const RUN_TASK_ACK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionAddress {
    pub execution_type: ExecutionType,
    pub execution_id: String,
    pub application: String,
}

impl ExecutionAddress {
    pub fn new(execution_type: ExecutionType, execution_id: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            execution_type,
            execution_id: execution_id.into(),
            application: application.into(),
        }
    }

    pub fn stage(&self, stage_id: impl Into<String>) -> StageAddress {
        StageAddress {
            execution: self.clone(),
            stage_id: stage_id.into(),
        }
    }
}

impl From<&Execution> for ExecutionAddress {
    fn from(execution: &Execution) -> Self {
        Self::new(execution.execution_type, &execution.id, &execution.application)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAddress {
    #[serde(flatten)]
    pub execution: ExecutionAddress,
    pub stage_id: String,
}

impl StageAddress {
    pub fn of(execution: &Execution, stage: &Stage) -> Self {
        ExecutionAddress::from(execution).stage(&stage.id)
    }

    pub fn task(&self, task_id: impl Into<String>) -> TaskAddress {
        TaskAddress {
            stage: self.clone(),
            task_id: task_id.into(),
        }
    }

    /// Same execution, different stage
    pub fn sibling(&self, stage_id: impl Into<String>) -> StageAddress {
        self.execution.stage(stage_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAddress {
    #[serde(flatten)]
    pub stage: StageAddress,
    pub task_id: String,
}

impl TaskAddress {
    pub fn execution(&self) -> &ExecutionAddress {
        &self.stage.execution
    }

    /// Same stage, different task
    pub fn sibling(&self, task_id: impl Into<String>) -> TaskAddress {
        self.stage.task(task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTask {
    #[serde(flatten)]
    pub task: TaskAddress,
    pub status: ExecutionStatus,
    pub original_status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTask {
    #[serde(flatten)]
    pub task: TaskAddress,
    pub task_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueParentStage {
    #[serde(flatten)]
    pub stage: StageAddress,
    pub phase: SyntheticStageOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartStage {
    #[serde(flatten)]
    pub stage: StageAddress,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelExecution {
    #[serde(flatten)]
    pub execution: ExecutionAddress,
    pub user: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWaitingExecutions {
    pub pipeline_config_id: String,
    pub purge_queue: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidTaskType {
    #[serde(flatten)]
    pub stage: StageAddress,
    pub class_name: String,
}

/// Tagged union of every message the queue carries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Message {
    StartExecution(ExecutionAddress),
    StartStage(StageAddress),
    StartTask(TaskAddress),
    CompleteTask(CompleteTask),
    PauseTask(TaskAddress),
    ResumeTask(TaskAddress),
    RunTask(RunTask),
    ContinueParentStage(ContinueParentStage),
    CompleteStage(StageAddress),
    SkipStage(StageAddress),
    AbortStage(StageAddress),
    PauseStage(StageAddress),
    RestartStage(RestartStage),
    ResumeStage(StageAddress),
    CancelStage(StageAddress),
    RescheduleExecution(ExecutionAddress),
    CompleteExecution(ExecutionAddress),
    ResumeExecution(ExecutionAddress),
    CancelExecution(CancelExecution),
    StartWaitingExecutions(StartWaitingExecutions),
    InvalidExecutionId(ExecutionAddress),
    InvalidStageId(StageAddress),
    InvalidTaskId(TaskAddress),
    InvalidTaskType(InvalidTaskType),
    NoDownstreamTasks(TaskAddress),
}

/// Fieldless discriminant of [`Message`], used for handler lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    StartExecution,
    StartStage,
    StartTask,
    CompleteTask,
    PauseTask,
    ResumeTask,
    RunTask,
    ContinueParentStage,
    CompleteStage,
    SkipStage,
    AbortStage,
    PauseStage,
    RestartStage,
    ResumeStage,
    CancelStage,
    RescheduleExecution,
    CompleteExecution,
    ResumeExecution,
    CancelExecution,
    StartWaitingExecutions,
    InvalidExecutionId,
    InvalidStageId,
    InvalidTaskId,
    InvalidTaskType,
    NoDownstreamTasks,
}

impl MessageKind {
    pub const CONFIGURATION_ERRORS: &'static [MessageKind] = &[
        MessageKind::InvalidExecutionId,
        MessageKind::InvalidStageId,
        MessageKind::InvalidTaskId,
        MessageKind::InvalidTaskType,
        MessageKind::NoDownstreamTasks,
    ];

    /// Wire discriminator, identical to the serialized `kind`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartExecution => "startExecution",
            Self::StartStage => "startStage",
            Self::StartTask => "startTask",
            Self::CompleteTask => "completeTask",
            Self::PauseTask => "pauseTask",
            Self::ResumeTask => "resumeTask",
            Self::RunTask => "runTask",
            Self::ContinueParentStage => "continueParentStage",
            Self::CompleteStage => "completeStage",
            Self::SkipStage => "skipStage",
            Self::AbortStage => "abortStage",
            Self::PauseStage => "pauseStage",
            Self::RestartStage => "restartStage",
            Self::ResumeStage => "resumeStage",
            Self::CancelStage => "cancelStage",
            Self::RescheduleExecution => "rescheduleExecution",
            Self::CompleteExecution => "completeExecution",
            Self::ResumeExecution => "resumeExecution",
            Self::CancelExecution => "cancelExecution",
            Self::StartWaitingExecutions => "startWaitingExecutions",
            Self::InvalidExecutionId => "invalidExecutionId",
            Self::InvalidStageId => "invalidStageId",
            Self::InvalidTaskId => "invalidTaskId",
            Self::InvalidTaskType => "invalidTaskType",
            Self::NoDownstreamTasks => "noDownstreamTasks",
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        Self::CONFIGURATION_ERRORS.contains(self)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::StartExecution(_) => MessageKind::StartExecution,
            Self::StartStage(_) => MessageKind::StartStage,
            Self::StartTask(_) => MessageKind::StartTask,
            Self::CompleteTask(_) => MessageKind::CompleteTask,
            Self::PauseTask(_) => MessageKind::PauseTask,
            Self::ResumeTask(_) => MessageKind::ResumeTask,
            Self::RunTask(_) => MessageKind::RunTask,
            Self::ContinueParentStage(_) => MessageKind::ContinueParentStage,
            Self::CompleteStage(_) => MessageKind::CompleteStage,
            Self::SkipStage(_) => MessageKind::SkipStage,
            Self::AbortStage(_) => MessageKind::AbortStage,
            Self::PauseStage(_) => MessageKind::PauseStage,
            Self::RestartStage(_) => MessageKind::RestartStage,
            Self::ResumeStage(_) => MessageKind::ResumeStage,
            Self::CancelStage(_) => MessageKind::CancelStage,
            Self::RescheduleExecution(_) => MessageKind::RescheduleExecution,
            Self::CompleteExecution(_) => MessageKind::CompleteExecution,
            Self::ResumeExecution(_) => MessageKind::ResumeExecution,
            Self::CancelExecution(_) => MessageKind::CancelExecution,
            Self::StartWaitingExecutions(_) => MessageKind::StartWaitingExecutions,
            Self::InvalidExecutionId(_) => MessageKind::InvalidExecutionId,
            Self::InvalidStageId(_) => MessageKind::InvalidStageId,
            Self::InvalidTaskId(_) => MessageKind::InvalidTaskId,
            Self::InvalidTaskType(_) => MessageKind::InvalidTaskType,
            Self::NoDownstreamTasks(_) => MessageKind::NoDownstreamTasks,
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        self.kind().is_configuration_error()
    }

    /// Execution the message is addressed to; `None` only for
    /// `StartWaitingExecutions`, which targets a pipeline config
    pub fn execution_address(&self) -> Option<&ExecutionAddress> {
        match self {
            Self::StartExecution(a)
            | Self::RescheduleExecution(a)
            | Self::CompleteExecution(a)
            | Self::ResumeExecution(a)
            | Self::InvalidExecutionId(a) => Some(a),
            Self::CancelExecution(m) => Some(&m.execution),
            Self::StartWaitingExecutions(_) => None,
            _ => self.stage_address().map(|s| &s.execution),
        }
    }

    pub fn stage_address(&self) -> Option<&StageAddress> {
        match self {
            Self::StartStage(a)
            | Self::CompleteStage(a)
            | Self::SkipStage(a)
            | Self::AbortStage(a)
            | Self::PauseStage(a)
            | Self::ResumeStage(a)
            | Self::CancelStage(a)
            | Self::InvalidStageId(a) => Some(a),
            Self::ContinueParentStage(m) => Some(&m.stage),
            Self::RestartStage(m) => Some(&m.stage),
            Self::InvalidTaskType(m) => Some(&m.stage),
            _ => self.task_address().map(|t| &t.stage),
        }
    }

    pub fn task_address(&self) -> Option<&TaskAddress> {
        match self {
            Self::StartTask(a)
            | Self::PauseTask(a)
            | Self::ResumeTask(a)
            | Self::InvalidTaskId(a)
            | Self::NoDownstreamTasks(a) => Some(a),
            Self::CompleteTask(m) => Some(&m.task),
            Self::RunTask(m) => Some(&m.task),
            _ => None,
        }
    }

    pub fn application(&self) -> Option<&str> {
        self.execution_address().map(|a| a.application.as_str())
    }

    /// Stable identity of the message body, used to de-duplicate queue entries
    pub fn fingerprint(&self) -> String {
        let body = serde_json::to_vec(self).unwrap_or_else(|_| format!("{self:?}").into_bytes());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &body).to_string()
    }

    /// Ack deadline that overrides the queue default for this message
    pub fn ack_timeout_override(&self) -> Option<Duration> {
        match self {
            Self::RunTask(_) => Some(RUN_TASK_ACK_TIMEOUT),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        if let Some(address) = self.execution_address() {
            write!(f, " execution={}", address.execution_id)?;
        }
        if let Some(address) = self.stage_address() {
            write!(f, " stage={}", address.stage_id)?;
        }
        if let Some(address) = self.task_address() {
            write!(f, " task={}", address.task_id)?;
        }
        Ok(())
    }
}
