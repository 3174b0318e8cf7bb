use crate::messaging::MessageKind;
use crate::pipeline::PlanningError;
use crate::queue::QueueError;
use crate::repository::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{handler} does not handle {kind} messages")]
    UnsupportedMessageType { handler: String, kind: MessageKind },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Internal handler error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn unsupported(handler: impl Into<String>, kind: MessageKind) -> Self {
        Self::UnsupportedMessageType {
            handler: handler.into(),
            kind,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
