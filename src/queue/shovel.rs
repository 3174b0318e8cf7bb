//! # Queue Shovel
//!
//! Moves messages off a previous queue implementation onto the current one,
//! one message per scheduled run while its activator is enabled. The source
//! message is acked only after the push to the destination succeeded; on a
//! failed push the delivery is left un-acked so the source queue's own retry
//! handling brings it back.

use super::{Ack, Activator, Queue, QueueMetrics, ScheduledAction};
use crate::messaging::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct QueueShovel {
    queue: Arc<dyn Queue>,
    previous_queue: Arc<dyn Queue>,
    activator: Arc<dyn Activator>,
    metrics: Arc<dyn QueueMetrics>,
}

impl QueueShovel {
    pub fn new(
        queue: Arc<dyn Queue>,
        previous_queue: Arc<dyn Queue>,
        activator: Arc<dyn Activator>,
        metrics: Arc<dyn QueueMetrics>,
    ) -> Self {
        Self {
            queue,
            previous_queue,
            activator,
            metrics,
        }
    }

    /// Shovel at most one message; returns how many were moved
    pub async fn migrate_one(&self) -> usize {
        if !self.activator.enabled() {
            return 0;
        }

        let mut deliveries: Vec<(Message, Ack)> = Vec::new();
        if let Err(e) = self
            .previous_queue
            .poll(&mut |message, ack| deliveries.push((message, ack)))
            .await
        {
            error!(
                from = %self.previous_queue.name(),
                error = %e,
                "Failed to poll previous queue for shoveling"
            );
            self.metrics.shovel_error();
            return 0;
        }

        let mut moved = 0;
        for (message, ack) in deliveries {
            match self.queue.push(message.clone(), Duration::ZERO).await {
                Ok(()) => {
                    if let Err(e) = ack.ack().await {
                        warn!(message = %message, error = %e, "Shoveled message could not be acked on previous queue");
                    }
                    debug!(
                        from = %self.previous_queue.name(),
                        to = %self.queue.name(),
                        message = %message,
                        "🚚 Shoveled message"
                    );
                    self.metrics.message_shoveled();
                    moved += 1;
                }
                Err(e) => {
                    error!(
                        message = %message,
                        error = %e,
                        "Failed to shovel message, leaving it un-acked on previous queue"
                    );
                    self.metrics.shovel_error();
                }
            }
        }
        moved
    }

    pub fn start(self: Arc<Self>, interval: Duration) -> ScheduledAction {
        info!(
            from = %self.previous_queue.name(),
            to = %self.queue.name(),
            "🚀 Starting queue shovel"
        );
        ScheduledAction::spawn("queue-shovel", interval, move || {
            let shovel = self.clone();
            async move {
                shovel.migrate_one().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::messaging::ExecutionAddress;
    use crate::models::ExecutionType;
    use crate::queue::{
        AtomicQueueMetrics, InMemoryQueue, MessagePredicate, NoopQueue, PollCallback, QueueError,
        QueueResult, QueueState, StaticActivator,
    };
    use async_trait::async_trait;

    fn start(id: &str) -> Message {
        Message::StartExecution(ExecutionAddress::new(ExecutionType::Pipeline, id, "app"))
    }

    #[derive(Debug)]
    struct RejectingQueue;

    #[async_trait]
    impl Queue for RejectingQueue {
        fn name(&self) -> &str {
            "rejecting"
        }
        async fn poll(&self, _callback: PollCallback<'_>) -> QueueResult<usize> {
            Ok(0)
        }
        async fn push(&self, _message: Message, _delay: Duration) -> QueueResult<()> {
            Err(QueueError::backend("push", "connection refused"))
        }
        async fn reschedule(&self, _message: &Message, _delay: Duration) -> QueueResult<()> {
            Ok(())
        }
        async fn ensure(&self, _message: Message, _delay: Duration) -> QueueResult<()> {
            Ok(())
        }
        async fn retry(&self) -> QueueResult<()> {
            Ok(())
        }
        async fn read_state(&self) -> QueueResult<QueueState> {
            Ok(QueueState::default())
        }
        async fn contains_message(&self, _predicate: MessagePredicate<'_>) -> QueueResult<bool> {
            Ok(false)
        }
        fn ack_timeout(&self) -> Duration {
            Duration::ZERO
        }
    }

    #[tokio::test]
    async fn test_moved_message_is_acked_on_previous_queue() {
        let previous = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
        let metrics = Arc::new(AtomicQueueMetrics::new());
        previous.push(start("e1"), Duration::ZERO).await.unwrap();

        let shovel = QueueShovel::new(
            Arc::new(NoopQueue),
            previous.clone(),
            Arc::new(StaticActivator(true)),
            metrics.clone(),
        );
        assert_eq!(shovel.migrate_one().await, 1);

        let state = previous.read_state().await.unwrap();
        assert_eq!(state.depth, 0);
        assert_eq!(state.unacked, 0);
        assert_eq!(metrics.snapshot().messages_shoveled, 1);
    }

    #[tokio::test]
    async fn test_failed_push_leaves_message_unacked() {
        let previous = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
        let metrics = Arc::new(AtomicQueueMetrics::new());
        previous.push(start("e1"), Duration::ZERO).await.unwrap();

        let shovel = QueueShovel::new(
            Arc::new(RejectingQueue),
            previous.clone(),
            Arc::new(StaticActivator(true)),
            metrics.clone(),
        );
        assert_eq!(shovel.migrate_one().await, 0);

        assert_eq!(previous.read_state().await.unwrap().unacked, 1);
        assert_eq!(metrics.snapshot().shovel_errors, 1);
    }

    #[tokio::test]
    async fn test_disabled_activator_moves_nothing() {
        let previous = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
        let current = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
        previous.push(start("e1"), Duration::ZERO).await.unwrap();

        let shovel = QueueShovel::new(
            current.clone(),
            previous.clone(),
            Arc::new(StaticActivator(false)),
            Arc::new(AtomicQueueMetrics::new()),
        );
        assert_eq!(shovel.migrate_one().await, 0);
        assert_eq!(previous.read_state().await.unwrap().depth, 1);
    }
}
