//! # Queue Metrics
//!
//! Fire-and-forget counters for queue, traffic shaping, shovel and processor
//! activity. Two sinks are provided:
//!
//! - [`AtomicQueueMetrics`]: in-process counters with a [`MetricsSnapshot`]
//!   for tests and health output.
//! - [`OtelQueueMetrics`]: OpenTelemetry counters on the global meter
//!   provider, labelled with the queue name or message kind.
//!
//! Nothing here is ever consulted on the correctness path.

use crate::messaging::MessageKind;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub trait QueueMetrics: Send + Sync + fmt::Debug {
    fn poll_attempt(&self, _queue: &str) {}
    fn poll_error(&self, _queue: &str) {}
    fn message_pushed(&self, _queue: &str) {}
    fn message_acked(&self, _queue: &str) {}
    fn message_retried(&self, _queue: &str) {}
    fn message_dead(&self, _queue: &str) {}
    fn queue_intercepted(&self, _interceptor: &str) {}
    fn message_intercepted(&self, _interceptor: &str) {}
    fn interceptor_error(&self, _interceptor: &str) {}
    fn message_shoveled(&self) {}
    fn shovel_error(&self) {}
    fn handler_error(&self, _kind: MessageKind) {}
    fn handler_missing(&self, _kind: MessageKind) {}
}

/// Discards every measurement
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopQueueMetrics;

impl QueueMetrics for NoopQueueMetrics {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub poll_attempts: u64,
    pub poll_errors: u64,
    pub messages_pushed: u64,
    pub messages_acked: u64,
    pub messages_retried: u64,
    pub messages_dead: u64,
    pub queue_interceptions: u64,
    pub message_interceptions: u64,
    pub interceptor_errors: u64,
    pub messages_shoveled: u64,
    pub shovel_errors: u64,
    pub handler_errors: u64,
    pub handlers_missing: u64,
}

#[derive(Debug, Default)]
pub struct AtomicQueueMetrics {
    poll_attempts: AtomicU64,
    poll_errors: AtomicU64,
    messages_pushed: AtomicU64,
    messages_acked: AtomicU64,
    messages_retried: AtomicU64,
    messages_dead: AtomicU64,
    queue_interceptions: AtomicU64,
    message_interceptions: AtomicU64,
    interceptor_errors: AtomicU64,
    messages_shoveled: AtomicU64,
    shovel_errors: AtomicU64,
    handler_errors: AtomicU64,
    handlers_missing: AtomicU64,
}

impl AtomicQueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            poll_attempts: self.poll_attempts.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            messages_pushed: self.messages_pushed.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_retried: self.messages_retried.load(Ordering::Relaxed),
            messages_dead: self.messages_dead.load(Ordering::Relaxed),
            queue_interceptions: self.queue_interceptions.load(Ordering::Relaxed),
            message_interceptions: self.message_interceptions.load(Ordering::Relaxed),
            interceptor_errors: self.interceptor_errors.load(Ordering::Relaxed),
            messages_shoveled: self.messages_shoveled.load(Ordering::Relaxed),
            shovel_errors: self.shovel_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            handlers_missing: self.handlers_missing.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl QueueMetrics for AtomicQueueMetrics {
    fn poll_attempt(&self, _queue: &str) {
        Self::incr(&self.poll_attempts);
    }
    fn poll_error(&self, _queue: &str) {
        Self::incr(&self.poll_errors);
    }
    fn message_pushed(&self, _queue: &str) {
        Self::incr(&self.messages_pushed);
    }
    fn message_acked(&self, _queue: &str) {
        Self::incr(&self.messages_acked);
    }
    fn message_retried(&self, _queue: &str) {
        Self::incr(&self.messages_retried);
    }
    fn message_dead(&self, _queue: &str) {
        Self::incr(&self.messages_dead);
    }
    fn queue_intercepted(&self, _interceptor: &str) {
        Self::incr(&self.queue_interceptions);
    }
    fn message_intercepted(&self, _interceptor: &str) {
        Self::incr(&self.message_interceptions);
    }
    fn interceptor_error(&self, _interceptor: &str) {
        Self::incr(&self.interceptor_errors);
    }
    fn message_shoveled(&self) {
        Self::incr(&self.messages_shoveled);
    }
    fn shovel_error(&self) {
        Self::incr(&self.shovel_errors);
    }
    fn handler_error(&self, _kind: MessageKind) {
        Self::incr(&self.handler_errors);
    }
    fn handler_missing(&self, _kind: MessageKind) {
        Self::incr(&self.handlers_missing);
    }
}

static QUEUE_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    QUEUE_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("orca-queue"))
}

fn counter(name: &'static str, description: &'static str) -> Counter<u64> {
    meter().u64_counter(name).with_description(description).build()
}

/// OpenTelemetry-backed metrics on the global meter provider
pub struct OtelQueueMetrics {
    polls: Counter<u64>,
    poll_errors: Counter<u64>,
    pushed: Counter<u64>,
    acked: Counter<u64>,
    retried: Counter<u64>,
    dead: Counter<u64>,
    intercepted: Counter<u64>,
    interceptor_errors: Counter<u64>,
    shoveled: Counter<u64>,
    shovel_errors: Counter<u64>,
    handler_errors: Counter<u64>,
}

impl OtelQueueMetrics {
    pub fn new() -> Self {
        Self {
            polls: counter("orca.queue.polls.total", "Queue poll attempts"),
            poll_errors: counter("orca.queue.poll.errors.total", "Queue polls that failed"),
            pushed: counter("orca.queue.pushed.total", "Messages pushed"),
            acked: counter("orca.queue.acked.total", "Messages acknowledged"),
            retried: counter("orca.queue.retried.total", "Messages re-queued after ack timeout"),
            dead: counter("orca.queue.dead.total", "Messages routed to dead-letter handlers"),
            intercepted: counter("orca.queue.intercepted.total", "Traffic shaping interceptions"),
            interceptor_errors: counter("orca.queue.interceptor.errors.total", "Interceptor failures"),
            shoveled: counter("orca.queue.shoveled.total", "Messages shoveled between queues"),
            shovel_errors: counter("orca.queue.shovel.errors.total", "Shovel failures"),
            handler_errors: counter("orca.queue.handler.errors.total", "Message handler failures"),
        }
    }
}

impl Default for OtelQueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OtelQueueMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelQueueMetrics").finish_non_exhaustive()
    }
}

impl QueueMetrics for OtelQueueMetrics {
    fn poll_attempt(&self, queue: &str) {
        self.polls.add(1, &[KeyValue::new("queue", queue.to_string())]);
    }
    fn poll_error(&self, queue: &str) {
        self.poll_errors.add(1, &[KeyValue::new("queue", queue.to_string())]);
    }
    fn message_pushed(&self, queue: &str) {
        self.pushed.add(1, &[KeyValue::new("queue", queue.to_string())]);
    }
    fn message_acked(&self, queue: &str) {
        self.acked.add(1, &[KeyValue::new("queue", queue.to_string())]);
    }
    fn message_retried(&self, queue: &str) {
        self.retried.add(1, &[KeyValue::new("queue", queue.to_string())]);
    }
    fn message_dead(&self, queue: &str) {
        self.dead.add(1, &[KeyValue::new("queue", queue.to_string())]);
    }
    fn queue_intercepted(&self, interceptor: &str) {
        self.intercepted.add(
            1,
            &[
                KeyValue::new("interceptor", interceptor.to_string()),
                KeyValue::new("type", "queue"),
            ],
        );
    }
    fn message_intercepted(&self, interceptor: &str) {
        self.intercepted.add(
            1,
            &[
                KeyValue::new("interceptor", interceptor.to_string()),
                KeyValue::new("type", "message"),
            ],
        );
    }
    fn interceptor_error(&self, interceptor: &str) {
        self.interceptor_errors
            .add(1, &[KeyValue::new("interceptor", interceptor.to_string())]);
    }
    fn message_shoveled(&self) {
        self.shoveled.add(1, &[]);
    }
    fn shovel_error(&self) {
        self.shovel_errors.add(1, &[]);
    }
    fn handler_error(&self, kind: MessageKind) {
        self.handler_errors.add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("reason", "failed"),
            ],
        );
    }
    fn handler_missing(&self, kind: MessageKind) {
        self.handler_errors.add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("reason", "missing"),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_snapshot_counts() {
        let metrics = AtomicQueueMetrics::new();
        metrics.poll_attempt("q");
        metrics.poll_attempt("q");
        metrics.queue_intercepted("limit");
        metrics.handler_missing(MessageKind::StartStage);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.poll_attempts, 2);
        assert_eq!(snapshot.queue_interceptions, 1);
        assert_eq!(snapshot.handlers_missing, 1);
        assert_eq!(snapshot.poll_errors, 0);
    }

    #[test]
    fn test_otel_metrics_without_provider_are_noops() {
        let metrics = OtelQueueMetrics::new();
        metrics.poll_attempt("q");
        metrics.handler_error(MessageKind::RunTask);
    }
}
