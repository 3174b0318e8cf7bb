use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::constants::ExecutionStatus;
use crate::messaging::{Message, MessageKind};
use async_trait::async_trait;
use tracing::{error, warn};

/// Terminates executions whose messages could not be resolved or run.
///
/// `InvalidExecutionId` is only logged since there is nothing to terminate.
#[derive(Debug)]
pub struct ConfigurationErrorHandler {
    ctx: HandlerContext,
}

impl ConfigurationErrorHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for ConfigurationErrorHandler {
    fn name(&self) -> &'static str {
        "ConfigurationErrorHandler"
    }

    fn message_kinds(&self) -> &'static [MessageKind] {
        MessageKind::CONFIGURATION_ERRORS
    }

    async fn handle(&self, message: &Message) -> HandlerResult<()> {
        if !message.is_configuration_error() {
            return Err(HandlerError::unsupported(self.name(), message.kind()));
        }
        let Some(address) = message.execution_address() else {
            return Ok(());
        };

        if let Message::InvalidExecutionId(_) = message {
            error!(
                execution_type = %address.execution_type,
                execution_id = %address.execution_id,
                application = %address.application,
                "No such execution"
            );
            return Ok(());
        }

        error!(
            kind = %message.kind(),
            execution_id = %address.execution_id,
            stage_id = ?message.stage_address().map(|s| s.stage_id.as_str()),
            task_id = ?message.task_address().map(|t| t.task_id.as_str()),
            "🚫 Configuration error, terminating execution"
        );
        match self
            .ctx
            .repository
            .update_status(address.execution_type, &address.execution_id, ExecutionStatus::Terminal)
            .await
        {
            Err(e) if e.is_not_found() => {
                warn!(execution_id = %address.execution_id, "Execution vanished before it could be terminated");
                Ok(())
            }
            other => other.map_err(HandlerError::from),
        }
    }
}
