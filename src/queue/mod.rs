//! # Queue
//!
//! Durable, at-least-once, delayed-delivery work queue.
//!
//! ## Delivery contract
//!
//! - `push(message, delay)` makes the message visible at `now + delay`. Pushing
//!   a message whose fingerprint is already queued moves the existing entry to
//!   the new delivery time instead of adding a second copy.
//! - `poll` hands ready messages to the callback together with an [`Ack`]. The
//!   delivered entry stays in flight until it is acked or its ack deadline
//!   passes; a queued copy with the same fingerprint is held back meanwhile.
//! - `retry` moves in-flight entries past their deadline back to the ready
//!   set. After `max_retries` unacknowledged deliveries the message goes to
//!   every registered [`DeadMessageCallback`] once and is dropped.
//!
//! Handlers must therefore be idempotent: redelivery after an ack timeout is
//! expected behaviour, not an error.

pub mod activator;
pub mod errors;
pub mod in_memory;
pub mod metrics;
pub mod noop;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod scheduled;
pub mod shovel;
pub mod traffic_shaping;

use crate::messaging::Message;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use activator::{all_enabled, Activator, StaticActivator, SwitchActivator};
pub use errors::{QueueError, QueueResult};
pub use in_memory::InMemoryQueue;
pub use metrics::{AtomicQueueMetrics, MetricsSnapshot, NoopQueueMetrics, OtelQueueMetrics, QueueMetrics};
pub use noop::NoopQueue;
#[cfg(feature = "postgres")]
pub use postgres::PostgresQueue;
pub use scheduled::ScheduledAction;
pub use shovel::QueueShovel;
pub use traffic_shaping::{
    ApplicationRateLimitInterceptor, InterceptorCallback, InterceptorType,
    PollRateLimitInterceptor, TrafficShapingInterceptor, TrafficShapingQueue,
};

/// Callback receiving each delivered message
pub type PollCallback<'a> = &'a mut (dyn FnMut(Message, Ack) + Send);

/// Predicate over queued or in-flight messages
pub type MessagePredicate<'a> = &'a (dyn Fn(&Message) -> bool + Send + Sync);

#[async_trait]
pub trait Queue: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Deliver at most one ready message; returns how many were delivered
    async fn poll(&self, callback: PollCallback<'_>) -> QueueResult<usize>;

    /// Deliver up to `max` ready messages
    async fn poll_many(&self, max: usize, callback: PollCallback<'_>) -> QueueResult<usize> {
        let mut delivered = 0;
        while delivered < max {
            let count = self.poll(&mut *callback).await?;
            if count == 0 {
                break;
            }
            delivered += count;
        }
        Ok(delivered)
    }

    async fn push(&self, message: Message, delay: Duration) -> QueueResult<()>;

    /// Move a queued message to a new delivery time; no-op when absent
    async fn reschedule(&self, message: &Message, delay: Duration) -> QueueResult<()>;

    /// Push only when the message is neither queued nor in flight
    async fn ensure(&self, message: Message, delay: Duration) -> QueueResult<()>;

    /// Requeue in-flight messages whose ack deadline has passed
    async fn retry(&self) -> QueueResult<()>;

    async fn read_state(&self) -> QueueResult<QueueState>;

    async fn contains_message(&self, predicate: MessagePredicate<'_>) -> QueueResult<bool>;

    fn ack_timeout(&self) -> Duration;

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

/// Point-in-time counts for a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueState {
    /// Messages waiting for delivery, ready or not
    pub depth: usize,
    /// Waiting messages whose delivery time has passed
    pub ready: usize,
    /// Delivered messages awaiting ack
    pub unacked: usize,
    /// Stored message bodies no longer referenced by a queue entry
    pub orphaned: usize,
}

/// Backend side of an acknowledgement
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn acknowledge(&self, fingerprint: &str, token: &str) -> QueueResult<()>;
}

/// Acknowledgement handle for one delivery.
///
/// The token identifies the delivery, so acking a stale delivery after the
/// message was redelivered leaves the newer in-flight entry alone.
pub struct Ack {
    target: Arc<dyn Acknowledge>,
    fingerprint: String,
    token: String,
}

impl Ack {
    pub fn new(target: Arc<dyn Acknowledge>, fingerprint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            target,
            fingerprint: fingerprint.into(),
            token: token.into(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub async fn ack(self) -> QueueResult<()> {
        self.target.acknowledge(&self.fingerprint, &self.token).await
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("fingerprint", &self.fingerprint)
            .field("token", &self.token)
            .finish()
    }
}

/// Receives messages that exhausted their redelivery attempts
#[async_trait]
pub trait DeadMessageCallback: Send + Sync + fmt::Debug {
    async fn on_dead_message(&self, queue: &dyn Queue, message: &Message);
}
