//! # Queue System Bootstrap
//!
//! Wires a complete in-process system: configuration, queue, execution
//! repository, stage builders, task implementations, exception handlers and
//! one handler per message kind, driven by a [`QueueProcessor`].
//!
//! ```rust,no_run
//! use orca_queue::bootstrap::OrcaQueueSystem;
//! use orca_queue::models::{Execution, Stage};
//!
//! # async fn example() -> orca_queue::Result<()> {
//! let system = OrcaQueueSystem::builder().build().await?;
//! system.start();
//!
//! let execution = Execution::pipeline("app").with_stage(
//!     Stage::new("wait", "pause", "1").with_context("waitTime", serde_json::json!(5)),
//! );
//! system.submit(&execution).await?;
//! # system.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The queue defaults to [`InMemoryQueue`]; when the configuration carries a
//! `database` section (and the `postgres` feature is on) a [`PostgresQueue`]
//! is connected instead. Traffic shaping wraps whichever queue is chosen when
//! any interceptor is configured.
//!
//! [`PostgresQueue`]: crate::queue::PostgresQueue

use crate::clock::{Clock, SystemClock};
use crate::config::{QueueSystemConfig, TrafficShapingConfig};
use crate::error::{OrcaError, Result};
use crate::exceptions::{ExceptionHandler, ExceptionHandlerChain};
use crate::handlers::{all_handlers, DeadMessageHandler, HandlerContext};
use crate::messaging::{
    CancelExecution, ExecutionAddress, Message, RestartStage, StageAddress,
};
use crate::models::Execution;
use crate::pipeline::{StageBuilderRegistry, StageDefinitionBuilder};
use crate::processor::QueueProcessor;
use crate::queue::{
    Activator, ApplicationRateLimitInterceptor, InMemoryQueue, NoopQueueMetrics,
    PollRateLimitInterceptor, Queue, QueueMetrics, QueueShovel, ScheduledAction,
    TrafficShapingInterceptor, TrafficShapingQueue,
};
use crate::repository::{ExecutionRepository, InMemoryExecutionRepository};
use crate::tasks::{Task, TaskResolver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on poll cycles for [`OrcaQueueSystem::process_available`]
const MAX_DRAIN_CYCLES: usize = 10_000;

#[derive(Debug, Default)]
pub struct OrcaQueueSystemBuilder {
    config: QueueSystemConfig,
    queue: Option<Arc<dyn Queue>>,
    previous_queue: Option<Arc<dyn Queue>>,
    repository: Option<Arc<dyn ExecutionRepository>>,
    clock: Option<Arc<dyn Clock>>,
    stage_builders: Vec<Arc<dyn StageDefinitionBuilder>>,
    tasks: Vec<Arc<dyn Task>>,
    exception_handlers: Vec<Arc<dyn ExceptionHandler>>,
    metrics: Option<Arc<dyn QueueMetrics>>,
    activators: Vec<Arc<dyn Activator>>,
}

impl OrcaQueueSystemBuilder {
    pub fn with_config(mut self, config: QueueSystemConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `queue` instead of building one from the configuration
    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Queue to drain onto the active one while `shovel.enabled` is set
    pub fn with_previous_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.previous_queue = Some(queue);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn ExecutionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_stage_builder(mut self, builder: Arc<dyn StageDefinitionBuilder>) -> Self {
        self.stage_builders.push(builder);
        self
    }

    pub fn with_task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Consulted ahead of the default handler, in registration order
    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handlers.push(handler);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_activator(mut self, activator: Arc<dyn Activator>) -> Self {
        self.activators.push(activator);
        self
    }

    pub async fn build(self) -> Result<OrcaQueueSystem> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopQueueMetrics));

        let queue = match self.queue {
            Some(queue) => queue,
            None => build_queue(&config, clock.clone(), metrics.clone()).await?,
        };
        let queue = shape_traffic(queue, &config.traffic_shaping, metrics.clone());
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryExecutionRepository::new(clock.clone())));

        let mut stage_builders = StageBuilderRegistry::with_defaults();
        for builder in self.stage_builders {
            stage_builders.register(builder);
        }
        let mut tasks = TaskResolver::with_defaults(clock.clone());
        for task in self.tasks {
            tasks.register(task);
        }
        let mut exception_handlers = ExceptionHandlerChain::with_default();
        for handler in self.exception_handlers.into_iter().rev() {
            exception_handlers.prepend(handler);
        }

        let context = HandlerContext::new(queue.clone(), repository.clone())
            .with_clock(clock)
            .with_stage_builders(stage_builders)
            .with_tasks(tasks)
            .with_exception_handlers(exception_handlers)
            .with_metrics(metrics.clone())
            .with_config(config.clone());
        let handlers = all_handlers(&context);
        let processor = Arc::new(
            QueueProcessor::new(queue.clone(), handlers, config.processor.clone())
                .with_activators(self.activators.clone())
                .with_metrics(metrics.clone()),
        );

        let shovel = match (self.previous_queue, config.shovel.enabled) {
            (Some(previous), true) => {
                let activator: Arc<dyn Activator> = Arc::new(AllActivators(self.activators));
                Some(Arc::new(QueueShovel::new(queue.clone(), previous, activator, metrics)))
            }
            (Some(_), false) => {
                warn!("Previous queue supplied but shovel is disabled");
                None
            }
            (None, _) => None,
        };

        info!(
            environment = %config.environment,
            queue = %queue.name(),
            concurrency = config.processor.concurrency,
            shovel = shovel.is_some(),
            "🏗️ Queue system assembled"
        );

        Ok(OrcaQueueSystem {
            config,
            queue,
            repository,
            context,
            processor,
            shovel,
            running: Mutex::new(Vec::new()),
        })
    }
}

async fn build_queue(
    config: &QueueSystemConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn QueueMetrics>,
) -> Result<Arc<dyn Queue>> {
    #[cfg(feature = "postgres")]
    if let Some(database) = &config.database {
        let queue = crate::queue::PostgresQueue::connect(database, &config.queue)
            .await?
            .with_clock(clock)
            .with_metrics(metrics)
            .with_dead_message_handler(Arc::new(DeadMessageHandler));
        queue.ensure_schema().await?;
        return Ok(Arc::new(queue));
    }
    #[cfg(not(feature = "postgres"))]
    if config.database.is_some() {
        warn!("Database configured but the postgres feature is disabled; using the in-memory queue");
    }

    Ok(Arc::new(
        InMemoryQueue::with_clock(&config.queue, clock)
            .with_metrics(metrics)
            .with_dead_message_handler(Arc::new(DeadMessageHandler)),
    ))
}

fn shape_traffic(
    queue: Arc<dyn Queue>,
    config: &TrafficShapingConfig,
    metrics: Arc<dyn QueueMetrics>,
) -> Arc<dyn Queue> {
    if !config.is_enabled() {
        return queue;
    }
    let mut interceptors: Vec<Arc<dyn TrafficShapingInterceptor>> = Vec::new();
    if let Some(limit) = &config.poll_rate_limit {
        interceptors.push(Arc::new(
            PollRateLimitInterceptor::new(limit.max_polls, limit.window()).with_priority(limit.priority),
        ));
    }
    if let Some(limit) = &config.application_rate_limit {
        interceptors.push(Arc::new(
            ApplicationRateLimitInterceptor::new(limit.max_messages, limit.window(), limit.delay())
                .with_priority(limit.priority),
        ));
    }
    Arc::new(TrafficShapingQueue::new(queue, interceptors, metrics))
}

/// Enabled while every wrapped activator is
#[derive(Debug)]
struct AllActivators(Vec<Arc<dyn Activator>>);

impl Activator for AllActivators {
    fn enabled(&self) -> bool {
        crate::queue::all_enabled(&self.0)
    }
}

/// Handle on a running (or startable) queue system
#[derive(Debug)]
pub struct OrcaQueueSystem {
    config: Arc<QueueSystemConfig>,
    queue: Arc<dyn Queue>,
    repository: Arc<dyn ExecutionRepository>,
    context: HandlerContext,
    processor: Arc<QueueProcessor>,
    shovel: Option<Arc<QueueShovel>>,
    running: Mutex<Vec<ScheduledAction>>,
}

impl OrcaQueueSystem {
    pub fn builder() -> OrcaQueueSystemBuilder {
        OrcaQueueSystemBuilder::default()
    }

    pub fn config(&self) -> &QueueSystemConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    pub fn processor(&self) -> &Arc<QueueProcessor> {
        &self.processor
    }

    pub fn is_running(&self) -> bool {
        !self.running.lock().is_empty()
    }

    /// Spawn the processor loop, the redelivery scan and the shovel
    pub fn start(&self) {
        let mut running = self.running.lock();
        if !running.is_empty() {
            warn!("Queue system already started");
            return;
        }

        running.push(self.processor.clone().start());

        let queue = self.queue.clone();
        running.push(ScheduledAction::spawn(
            "queue-retry",
            self.config.retry.scan_interval(),
            move || {
                let queue = queue.clone();
                async move {
                    if let Err(e) = queue.retry().await {
                        warn!(queue = %queue.name(), error = %e, "Redelivery scan failed");
                    }
                }
            },
        ));

        if let Some(shovel) = &self.shovel {
            running.push(shovel.clone().start(self.config.shovel.interval()));
        }
        info!(queue = %self.queue.name(), actions = running.len(), "🚀 Queue system started");
    }

    /// Stop every background action, then close the queue
    pub async fn shutdown(&self) -> Result<()> {
        let actions: Vec<ScheduledAction> = std::mem::take(&mut *self.running.lock());
        for action in actions {
            action.shutdown().await;
        }
        self.queue.close().await?;
        info!(queue = %self.queue.name(), "🛑 Queue system shut down");
        Ok(())
    }

    /// Store a new execution and queue its start
    pub async fn submit(&self, execution: &Execution) -> Result<ExecutionAddress> {
        self.repository.store(execution).await?;
        let address = ExecutionAddress::from(execution);
        self.queue
            .push(Message::StartExecution(address.clone()), Duration::ZERO)
            .await?;
        info!(
            execution_id = %execution.id,
            application = %execution.application,
            stages = execution.stages.len(),
            "📥 Execution submitted"
        );
        Ok(address)
    }

    pub async fn cancel(&self, address: &ExecutionAddress, user: Option<&str>, reason: Option<&str>) -> Result<()> {
        self.push(Message::CancelExecution(CancelExecution {
            execution: address.clone(),
            user: user.map(str::to_string),
            reason: reason.map(str::to_string),
        }))
        .await
    }

    /// Pause immediately; running tasks park themselves on their next run
    pub async fn pause(&self, address: &ExecutionAddress, user: Option<&str>) -> Result<()> {
        self.repository
            .pause(address.execution_type, &address.execution_id, user)
            .await?;
        info!(execution_id = %address.execution_id, "⏸️ Execution paused");
        Ok(())
    }

    pub async fn resume(&self, address: &ExecutionAddress) -> Result<()> {
        self.push(Message::ResumeExecution(address.clone())).await
    }

    pub async fn restart_stage(&self, stage: &StageAddress, user: Option<&str>) -> Result<()> {
        self.push(Message::RestartStage(RestartStage {
            stage: stage.clone(),
            user: user.map(str::to_string),
        }))
        .await
    }

    pub async fn skip_stage(&self, stage: &StageAddress) -> Result<()> {
        self.push(Message::SkipStage(stage.clone())).await
    }

    /// Handle every ready message, including those the handlers push, until
    /// the queue has nothing ready. Returns the number handled.
    pub async fn process_available(&self) -> usize {
        self.processor.process_available(MAX_DRAIN_CYCLES).await
    }

    async fn push(&self, message: Message) -> Result<()> {
        self.queue.push(message, Duration::ZERO).await.map_err(OrcaError::from)
    }
}
