use super::{ExecutionRepository, RepositoryError, RepositoryResult};
use crate::clock::{Clock, SystemClock};
use crate::constants::ExecutionStatus;
use crate::models::{Execution, ExecutionType, PausedDetails, Stage, StagePosition};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Key = (ExecutionType, String);

/// Process-local repository, mainly for tests and single-node demos
#[derive(Debug)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<Key, Execution>>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl Default for InMemoryExecutionRepository {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryExecutionRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of successful mutating calls
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.read().is_empty()
    }

    fn mutate<T>(
        &self,
        execution_type: ExecutionType,
        id: &str,
        f: impl FnOnce(&mut Execution) -> RepositoryResult<T>,
    ) -> RepositoryResult<T> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&(execution_type, id.to_string()))
            .ok_or_else(|| RepositoryError::not_found(execution_type, id))?;
        let result = f(execution)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn retrieve(&self, execution_type: ExecutionType, id: &str) -> RepositoryResult<Execution> {
        self.executions
            .read()
            .get(&(execution_type, id.to_string()))
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(execution_type, id))
    }

    async fn store(&self, execution: &Execution) -> RepositoryResult<()> {
        self.executions
            .write()
            .insert((execution.execution_type, execution.id.clone()), execution.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn store_stage(&self, execution_type: ExecutionType, id: &str, stage: &Stage) -> RepositoryResult<()> {
        self.mutate(execution_type, id, |execution| {
            execution.upsert_stage(stage.clone());
            Ok(())
        })
    }

    async fn add_stage(
        &self,
        execution_type: ExecutionType,
        id: &str,
        stage: &Stage,
        position: StagePosition,
    ) -> RepositoryResult<()> {
        self.mutate(execution_type, id, |execution| {
            execution.place_stage(stage.clone(), &position);
            Ok(())
        })
    }

    async fn remove_stage(&self, execution_type: ExecutionType, id: &str, stage_id: &str) -> RepositoryResult<()> {
        self.mutate(execution_type, id, |execution| {
            execution
                .remove_stage(stage_id)
                .map(|_| ())
                .ok_or_else(|| RepositoryError::stage_not_found(&execution.id, stage_id))
        })
    }

    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> RepositoryResult<()> {
        let now = self.clock.now();
        self.mutate(execution_type, id, |execution| {
            execution.status = status;
            if status == ExecutionStatus::Running {
                execution.start_time.get_or_insert(now);
                execution.end_time = None;
            } else if status.is_complete() {
                execution.end_time = Some(now);
            }
            Ok(())
        })
    }

    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> RepositoryResult<()> {
        self.mutate(execution_type, id, |execution| {
            execution.canceled = true;
            execution.canceled_by = user.map(str::to_string);
            execution.cancellation_reason = reason.map(str::to_string);
            Ok(())
        })
    }

    async fn pause(&self, execution_type: ExecutionType, id: &str, user: Option<&str>) -> RepositoryResult<()> {
        let now = self.clock.now();
        self.mutate(execution_type, id, |execution| {
            execution.status = ExecutionStatus::Paused;
            execution.paused = Some(PausedDetails {
                paused_by: user.map(str::to_string),
                pause_time: Some(now),
                resumed_by: None,
                resume_time: None,
            });
            Ok(())
        })
    }

    async fn resume(&self, execution_type: ExecutionType, id: &str, user: Option<&str>) -> RepositoryResult<()> {
        let now = self.clock.now();
        self.mutate(execution_type, id, |execution| {
            execution.status = ExecutionStatus::Running;
            let paused = execution.paused.get_or_insert_with(PausedDetails::default);
            paused.resumed_by = user.map(str::to_string);
            paused.resume_time = Some(now);
            Ok(())
        })
    }

    async fn retrieve_by_config_id(&self, pipeline_config_id: &str) -> RepositoryResult<Vec<Execution>> {
        let mut found: Vec<Execution> = self
            .executions
            .read()
            .values()
            .filter(|e| e.pipeline_config_id.as_deref() == Some(pipeline_config_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.build_time.cmp(&b.build_time).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn has_running(&self, pipeline_config_id: &str, excluding: &str) -> RepositoryResult<bool> {
        Ok(self.executions.read().values().any(|e| {
            e.pipeline_config_id.as_deref() == Some(pipeline_config_id)
                && e.id != excluding
                && e.status == ExecutionStatus::Running
        }))
    }
}
