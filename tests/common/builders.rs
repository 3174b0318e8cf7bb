//! System and pipeline builders shared by the integration tests

use super::tasks::{CountingTask, EchoTask, FailOnceTask, FailingTask, RedirectOnceTask};
use super::tasks::{COUNTING_TASK, ECHO_TASK, FAILING_TASK, FAIL_ONCE_TASK, FLAKY_TASK, REDIRECT_ONCE_TASK};
use chrono::{TimeZone, Utc};
use orca_queue::clock::ManualClock;
use orca_queue::config::{QueueSystemConfig, RetryConfig};
use orca_queue::models::{Execution, Stage};
use orca_queue::pipeline::{StageDefinitionBuilder, StageRequest, TaskGraph};
use orca_queue::repository::ExecutionRepository;
use orca_queue::{ExecutionAddress, OrcaQueueSystem, OrcaQueueSystemBuilder};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const APPLICATION: &str = "orca-tests";

pub const ECHO_STAGE: &str = "echo";
pub const FAIL_STAGE: &str = "fail";
pub const FLAKY_STAGE: &str = "flaky";
pub const FAIL_ONCE_STAGE: &str = "fail-once";
pub const DEPLOY_STAGE: &str = "deploy";
pub const LOOP_STAGE: &str = "loop";
pub const TWO_STEP_STAGE: &str = "two-step";

/// A built system whose clock only moves when a test advances it
pub struct TestSystem {
    pub system: OrcaQueueSystem,
    pub clock: Arc<ManualClock>,
}

impl TestSystem {
    /// Handle everything that is ready right now
    pub async fn run(&self) -> usize {
        self.system.process_available().await
    }

    /// Move the clock, requeue expired deliveries and handle what became ready
    pub async fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.system.queue().retry().await.expect("retry scan");
        self.run().await
    }

    pub async fn submit(&self, execution: &Execution) -> ExecutionAddress {
        self.system.submit(execution).await.expect("submit execution")
    }

    pub async fn execution(&self, address: &ExecutionAddress) -> Execution {
        self.system
            .repository()
            .retrieve(address.execution_type, &address.execution_id)
            .await
            .expect("stored execution")
    }

    pub async fn stage(&self, address: &ExecutionAddress, ref_id: &str) -> Stage {
        self.execution(address)
            .await
            .stage_by_ref(ref_id)
            .cloned()
            .unwrap_or_else(|| panic!("no stage with ref id {ref_id}"))
    }
}

pub fn test_config() -> QueueSystemConfig {
    QueueSystemConfig {
        environment: "test".to_string(),
        retry: RetryConfig {
            handler_retry_delay_ms: 100,
            ..RetryConfig::default()
        },
        ..QueueSystemConfig::default()
    }
}

pub async fn test_system() -> TestSystem {
    test_system_with(test_config(), |builder| builder).await
}

/// Build a system with the scripted tasks and stage types registered, then
/// let `configure` add or override anything
pub async fn test_system_with(
    config: QueueSystemConfig,
    configure: impl FnOnce(OrcaQueueSystemBuilder) -> OrcaQueueSystemBuilder,
) -> TestSystem {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
    ));
    let builder = OrcaQueueSystem::builder()
        .with_config(config)
        .with_clock(clock.clone())
        .with_task(Arc::new(EchoTask))
        .with_task(Arc::new(FailingTask))
        .with_task(Arc::new(FailOnceTask::default()))
        .with_task(Arc::new(CountingTask::default()))
        .with_task(Arc::new(RedirectOnceTask::default()))
        .with_stage_builder(Arc::new(SingleTaskStage::new(ECHO_STAGE, ECHO_TASK)))
        .with_stage_builder(Arc::new(SingleTaskStage::new(FAIL_STAGE, FAILING_TASK)))
        .with_stage_builder(Arc::new(SingleTaskStage::new(FLAKY_STAGE, FLAKY_TASK)))
        .with_stage_builder(Arc::new(SingleTaskStage::new(FAIL_ONCE_STAGE, FAIL_ONCE_TASK)))
        .with_stage_builder(Arc::new(TwoStepStage))
        .with_stage_builder(Arc::new(DeployStage))
        .with_stage_builder(Arc::new(LoopingStage));
    let system = configure(builder).build().await.expect("system builds");
    TestSystem { system, clock }
}

pub fn pipeline() -> Execution {
    Execution::pipeline(APPLICATION).with_name("integration")
}

pub fn echo(name: &str, ref_id: &str) -> Stage {
    Stage::new(ECHO_STAGE, name, ref_id)
}

pub fn wait(name: &str, ref_id: &str, seconds: u64) -> Stage {
    Stage::new("wait", name, ref_id).with_context("waitTime", json!(seconds))
}

/// Stage type running two echo tasks back to back
#[derive(Debug)]
pub struct TwoStepStage;

impl StageDefinitionBuilder for TwoStepStage {
    fn stage_type(&self) -> &str {
        TWO_STEP_STAGE
    }

    fn task_graph(&self, _stage: &Stage) -> TaskGraph {
        TaskGraph::builder()
            .with_task("first", ECHO_TASK)
            .with_task("second", ECHO_TASK)
            .build()
    }
}

/// Stage type whose graph is one task
#[derive(Debug)]
pub struct SingleTaskStage {
    stage_type: &'static str,
    task: &'static str,
}

impl SingleTaskStage {
    pub fn new(stage_type: &'static str, task: &'static str) -> Self {
        Self { stage_type, task }
    }
}

impl StageDefinitionBuilder for SingleTaskStage {
    fn stage_type(&self) -> &str {
        self.stage_type
    }

    fn task_graph(&self, _stage: &Stage) -> TaskGraph {
        TaskGraph::builder().with_task(self.stage_type, self.task).build()
    }
}

/// Runs a zero-length wait before itself and an echo stage after itself
#[derive(Debug)]
pub struct DeployStage;

impl StageDefinitionBuilder for DeployStage {
    fn stage_type(&self) -> &str {
        DEPLOY_STAGE
    }

    fn task_graph(&self, _stage: &Stage) -> TaskGraph {
        TaskGraph::builder().with_task("deploy", ECHO_TASK).build()
    }

    fn before_stages(&self, _stage: &Stage) -> Vec<StageRequest> {
        vec![StageRequest::new("wait", "Pre-deploy check").with_value("waitTime", json!(0))]
    }

    fn after_stages(&self, _stage: &Stage) -> Vec<StageRequest> {
        vec![StageRequest::new(ECHO_STAGE, "Announce deploy")]
    }
}

/// prepare, then a attempt/check loop, then finish
#[derive(Debug)]
pub struct LoopingStage;

impl StageDefinitionBuilder for LoopingStage {
    fn stage_type(&self) -> &str {
        LOOP_STAGE
    }

    fn task_graph(&self, _stage: &Stage) -> TaskGraph {
        TaskGraph::builder()
            .with_task("prepare", ECHO_TASK)
            .with_loop(|body| {
                body.with_task("attempt", COUNTING_TASK)
                    .with_task("check", REDIRECT_ONCE_TASK)
            })
            .with_task("finish", ECHO_TASK)
            .build()
    }
}
