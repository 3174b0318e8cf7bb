//! # Queue Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue backend error: {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Queue is closed: {queue_name}")]
    Closed { queue_name: String },
}

impl QueueError {
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    pub fn closed(queue_name: impl Into<String>) -> Self {
        Self::Closed {
            queue_name: queue_name.into(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend("sql", err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
