use crate::models::ExecutionType;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{execution_type} {execution_id} not found")]
    NotFound {
        execution_type: ExecutionType,
        execution_id: String,
    },

    #[error("Stage {stage_id} not found in execution {execution_id}")]
    StageNotFound {
        execution_id: String,
        stage_id: String,
    },

    #[error("Repository backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn not_found(execution_type: ExecutionType, execution_id: impl Into<String>) -> Self {
        Self::NotFound {
            execution_type,
            execution_id: execution_id.into(),
        }
    }

    pub fn stage_not_found(execution_id: impl Into<String>, stage_id: impl Into<String>) -> Self {
        Self::StageNotFound {
            execution_id: execution_id.into(),
            stage_id: stage_id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
