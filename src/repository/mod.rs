//! # Execution Repository
//!
//! Persistent home of the [`Execution`] aggregate. Handlers re-read the
//! execution on every message and write back only what they changed, so every
//! write method addresses the narrowest piece of state it touches.

pub mod errors;
pub mod in_memory;

use crate::constants::ExecutionStatus;
use crate::models::{Execution, ExecutionType, Stage, StagePosition};
use async_trait::async_trait;
use std::fmt;

pub use errors::{RepositoryError, RepositoryResult};
pub use in_memory::InMemoryExecutionRepository;

#[async_trait]
pub trait ExecutionRepository: Send + Sync + fmt::Debug {
    async fn retrieve(&self, execution_type: ExecutionType, id: &str) -> RepositoryResult<Execution>;

    /// Insert or replace a whole execution
    async fn store(&self, execution: &Execution) -> RepositoryResult<()>;

    /// Replace a stage by id, appending it when absent
    async fn store_stage(&self, execution_type: ExecutionType, id: &str, stage: &Stage) -> RepositoryResult<()>;

    /// Insert a stage at `position`; a stage with the same id is replaced in place
    async fn add_stage(
        &self,
        execution_type: ExecutionType,
        id: &str,
        stage: &Stage,
        position: StagePosition,
    ) -> RepositoryResult<()>;

    async fn remove_stage(&self, execution_type: ExecutionType, id: &str, stage_id: &str) -> RepositoryResult<()>;

    /// Set the execution status, stamping the start time on `RUNNING` and the
    /// end time on completion
    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> RepositoryResult<()>;

    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> RepositoryResult<()>;

    async fn pause(&self, execution_type: ExecutionType, id: &str, user: Option<&str>) -> RepositoryResult<()>;

    async fn resume(&self, execution_type: ExecutionType, id: &str, user: Option<&str>) -> RepositoryResult<()>;

    /// Executions of one pipeline config, oldest build time first
    async fn retrieve_by_config_id(&self, pipeline_config_id: &str) -> RepositoryResult<Vec<Execution>>;

    /// Whether an execution of the config other than `excluding` is running
    async fn has_running(&self, pipeline_config_id: &str, excluding: &str) -> RepositoryResult<bool>;
}
