use crate::constants::ExecutionStatus;
use crate::messaging::{CancelExecution, CompleteTask, Message};
use crate::queue::{DeadMessageCallback, Queue};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, warn};

/// User recorded on executions canceled because a message died
pub const DEAD_MESSAGE_USER: &str = "deadMessageHandler";

const DEAD_MESSAGE_REASON: &str = "dead message";

/// Terminates whatever a dead message was addressed to, so an execution is
/// never left waiting on work that will not be redelivered
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadMessageHandler;

impl DeadMessageHandler {
    /// Message that ends the dead message's target; configuration errors and
    /// unaddressed messages have nothing to end
    pub fn termination_message(message: &Message) -> Option<Message> {
        if message.is_configuration_error() {
            return None;
        }
        if let Some(task) = message.task_address() {
            return Some(Message::CompleteTask(CompleteTask {
                task: task.clone(),
                status: ExecutionStatus::Terminal,
                original_status: None,
            }));
        }
        if let Some(stage) = message.stage_address() {
            return Some(Message::AbortStage(stage.clone()));
        }
        message.execution_address().map(|execution| {
            Message::CancelExecution(CancelExecution {
                execution: execution.clone(),
                user: Some(DEAD_MESSAGE_USER.to_string()),
                reason: Some(DEAD_MESSAGE_REASON.to_string()),
            })
        })
    }
}

#[async_trait]
impl DeadMessageCallback for DeadMessageHandler {
    async fn on_dead_message(&self, queue: &dyn Queue, message: &Message) {
        warn!(
            kind = %message.kind(),
            execution_id = ?message.execution_address().map(|a| a.execution_id.as_str()),
            "💀 Dead message"
        );
        let Some(termination) = Self::termination_message(message) else {
            return;
        };
        if let Err(e) = queue.push(termination, Duration::ZERO).await {
            error!(kind = %message.kind(), error = %e, "Failed to terminate the target of a dead message");
        }
    }
}
