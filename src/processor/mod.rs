//! # Queue Processor
//!
//! Polls the queue on a fixed delay and dispatches each delivered message to
//! the [`MessageHandler`] registered for its kind on a bounded worker pool.
//!
//! ## Dispatch contract
//!
//! - A message is acked only after its handler returns `Ok`. A failed handler
//!   or a message kind without a handler leaves the delivery unacked, so the
//!   queue redelivers it once the ack deadline passes.
//! - Each cycle polls at most as many messages as there are free workers, or a
//!   single one when `fill_executor_each_cycle` is off.
//! - Nothing is polled while any [`Activator`] reports disabled.

use crate::config::ProcessorConfig;
use crate::handlers::MessageHandler;
use crate::messaging::{Message, MessageKind};
use crate::queue::{all_enabled, Ack, Activator, NoopQueueMetrics, Queue, QueueMetrics, ScheduledAction};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

pub struct QueueProcessor {
    queue: Arc<dyn Queue>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    handler_cache: DashMap<MessageKind, Arc<dyn MessageHandler>>,
    workers: Arc<Semaphore>,
    activators: Vec<Arc<dyn Activator>>,
    metrics: Arc<dyn QueueMetrics>,
    config: ProcessorConfig,
}

impl fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("queue", &self.queue.name())
            .field("handlers", &self.handlers.len())
            .field("available_workers", &self.workers.available_permits())
            .field("config", &self.config)
            .finish()
    }
}

impl QueueProcessor {
    pub fn new(queue: Arc<dyn Queue>, handlers: Vec<Arc<dyn MessageHandler>>, config: ProcessorConfig) -> Self {
        Self {
            queue,
            handlers,
            handler_cache: DashMap::new(),
            workers: Arc::new(Semaphore::new(config.concurrency)),
            activators: Vec::new(),
            metrics: Arc::new(NoopQueueMetrics),
            config,
        }
    }

    pub fn with_activators(mut self, activators: Vec<Arc<dyn Activator>>) -> Self {
        self.activators = activators;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Handler for `kind`, looked up once and cached
    pub fn handler_for(&self, kind: MessageKind) -> Option<Arc<dyn MessageHandler>> {
        if let Some(handler) = self.handler_cache.get(&kind) {
            return Some(handler.clone());
        }
        let handler = self
            .handlers
            .iter()
            .find(|h| h.message_kinds().contains(&kind))?
            .clone();
        self.handler_cache.insert(kind, handler.clone());
        Some(handler)
    }

    /// One poll cycle. Returns the spawned dispatch tasks so callers can await
    /// them.
    #[instrument(skip(self), fields(queue = %self.queue.name()))]
    pub async fn poll_once(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if !all_enabled(&self.activators) {
            debug!("Processor inactive, skipping poll");
            return Vec::new();
        }
        let available = self.workers.available_permits();
        let max = if self.config.fill_executor_each_cycle {
            available
        } else {
            available.min(1)
        };
        if max == 0 {
            return Vec::new();
        }

        self.metrics.poll_attempt(self.queue.name());
        let mut delivered: Vec<(Message, Ack)> = Vec::new();
        if let Err(e) = self
            .queue
            .poll_many(max, &mut |message, ack| delivered.push((message, ack)))
            .await
        {
            self.metrics.poll_error(self.queue.name());
            warn!(error = %e, "Queue poll failed");
        }

        let mut handles = Vec::with_capacity(delivered.len());
        for (message, ack) in delivered {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(kind = %message.kind(), "Worker pool closed, leaving message unacked");
                    break;
                }
            };
            let processor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                processor.dispatch(message, ack).await;
                drop(permit);
            }));
        }
        handles
    }

    #[instrument(skip_all, fields(kind = %message.kind()))]
    async fn dispatch(&self, message: Message, ack: Ack) {
        let kind = message.kind();
        let Some(handler) = self.handler_for(kind) else {
            self.metrics.handler_missing(kind);
            error!(kind = %kind, "No handler registered for message kind");
            return;
        };

        match handler.invoke(&message).await {
            Ok(()) => {
                if let Err(e) = ack.ack().await {
                    warn!(handler = handler.name(), error = %e, "Failed to ack handled message");
                }
            }
            Err(e) => {
                self.metrics.handler_error(kind);
                error!(
                    handler = handler.name(),
                    execution_id = ?message.execution_address().map(|a| a.execution_id.as_str()),
                    error = %e,
                    "❌ Handler failed, message will be redelivered"
                );
            }
        }
    }

    /// Run poll cycles until a cycle delivers nothing, waiting for each
    /// cycle's handlers. Returns the number of messages handled.
    pub async fn process_available(self: &Arc<Self>, max_cycles: usize) -> usize {
        let mut handled = 0;
        for _ in 0..max_cycles {
            let handles = self.poll_once().await;
            if handles.is_empty() {
                break;
            }
            handled += handles.len();
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Dispatch task panicked");
                }
            }
        }
        handled
    }

    /// Start the fixed-delay poll loop
    pub fn start(self: Arc<Self>) -> ScheduledAction {
        let interval = self.config.poll_interval();
        ScheduledAction::spawn("queue-processor", interval, move || {
            let processor = self.clone();
            async move {
                processor.poll_once().await;
            }
        })
    }
}
