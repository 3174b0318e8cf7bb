use super::{MessagePredicate, PollCallback, Queue, QueueResult, QueueState};
use crate::messaging::Message;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Queue that accepts and drops everything; polls never deliver.
///
/// Useful as the "new" side of a shovel dry run, or to disable queue
/// processing on an instance without unwiring the processor.
#[derive(Debug, Default, Clone)]
pub struct NoopQueue;

#[async_trait]
impl Queue for NoopQueue {
    fn name(&self) -> &str {
        "noop"
    }

    async fn poll(&self, _callback: PollCallback<'_>) -> QueueResult<usize> {
        Ok(0)
    }

    async fn push(&self, message: Message, _delay: Duration) -> QueueResult<()> {
        debug!(message = %message, "Dropping message pushed to noop queue");
        Ok(())
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
