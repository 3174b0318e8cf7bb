//! # Task Exception Handling
//!
//! Task failures are classified by a chain of [`ExceptionHandler`]s, queried
//! in registration order; the first handler that accepts an error decides
//! whether the task is retried or the failure recorded on the stage.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: i64 },

    /// Failure caused by user input, never retried
    #[error("{message}")]
    User { message: String },

    /// Transient failure worth retrying
    #[error("Retryable failure: {message}")]
    Retryable { message: String },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::User { .. } => "user",
            Self::Retryable { .. } => "retryable",
            Self::Failed(_) => "failed",
        }
    }
}

/// Classification of a task failure, stored in the stage context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub should_retry: bool,
    pub error_type: String,
    pub message: String,
    pub details: Value,
}

pub trait ExceptionHandler: Send + Sync + fmt::Debug {
    fn handles(&self, error: &TaskError) -> bool;

    fn handle(&self, task_name: &str, error: &TaskError) -> ExceptionDetails;
}

/// Accepts every error; only [`TaskError::Retryable`] is retried
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn handles(&self, _error: &TaskError) -> bool {
        true
    }

    fn handle(&self, task_name: &str, error: &TaskError) -> ExceptionDetails {
        let details = match error {
            TaskError::Failed(e) => serde_json::json!({
                "taskName": task_name,
                "causes": e.chain().skip(1).map(ToString::to_string).collect::<Vec<_>>(),
            }),
            _ => serde_json::json!({ "taskName": task_name }),
        };
        ExceptionDetails {
            should_retry: matches!(error, TaskError::Retryable { .. }),
            error_type: error.error_type().to_string(),
            message: error.to_string(),
            details,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExceptionHandlerChain {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl ExceptionHandlerChain {
    pub fn new(handlers: Vec<Arc<dyn ExceptionHandler>>) -> Self {
        Self { handlers }
    }

    /// Chain ending in [`DefaultExceptionHandler`]
    pub fn with_default() -> Self {
        Self::new(vec![Arc::new(DefaultExceptionHandler)])
    }

    /// Add a handler ahead of those already registered
    pub fn prepend(&mut self, handler: Arc<dyn ExceptionHandler>) {
        self.handlers.insert(0, handler);
    }

    pub fn handle(&self, task_name: &str, error: &TaskError) -> Option<ExceptionDetails> {
        self.handlers
            .iter()
            .find(|h| h.handles(error))
            .map(|h| h.handle(task_name, error))
    }
}
