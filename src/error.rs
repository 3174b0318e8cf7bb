use crate::config::ConfigurationError;
use crate::exceptions::TaskError;
use crate::handlers::HandlerError;
use crate::pipeline::PlanningError;
use crate::queue::QueueError;
use crate::repository::RepositoryError;
use thiserror::Error;

/// Crate-level error wrapping every subsystem error
#[derive(Debug, Error)]
pub enum OrcaError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("System error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, OrcaError>;
