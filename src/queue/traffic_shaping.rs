//! # Traffic Shaping
//!
//! [`TrafficShapingQueue`] decorates another queue with pluggable admission
//! control. Interceptors come in two families:
//!
//! - **Queue** interceptors are asked before each poll whether to skip it. The
//!   first one (by ascending priority) answering yes short-circuits the poll:
//!   nothing is delivered that cycle.
//! - **Message** interceptors are asked per delivered message. The first one
//!   returning a callback takes over that message; the downstream callback
//!   never sees it this cycle.
//!
//! An interceptor that errors is logged, counted and treated as "do not
//! intercept". Misbehaving interceptors never stop the queue.

use super::{
    Ack, MessagePredicate, PollCallback, Queue, QueueMetrics, QueueResult, QueueState,
};
use crate::messaging::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Replacement handling for an intercepted message
pub type InterceptorCallback =
    Box<dyn FnOnce(Arc<dyn Queue>, Message, Ack) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorType {
    Queue,
    Message,
}

#[async_trait]
pub trait TrafficShapingInterceptor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn supports(&self, interceptor_type: InterceptorType) -> bool;

    /// Lower values are consulted first
    fn priority(&self) -> i32 {
        0
    }

    async fn intercept_poll(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn intercept_message(&self, _message: &Message) -> anyhow::Result<Option<InterceptorCallback>> {
        Ok(None)
    }
}

pub struct TrafficShapingQueue {
    inner: Arc<dyn Queue>,
    interceptors: Vec<Arc<dyn TrafficShapingInterceptor>>,
    metrics: Arc<dyn QueueMetrics>,
}

impl TrafficShapingQueue {
    pub fn new(
        inner: Arc<dyn Queue>,
        mut interceptors: Vec<Arc<dyn TrafficShapingInterceptor>>,
        metrics: Arc<dyn QueueMetrics>,
    ) -> Self {
        interceptors.sort_by_key(|i| i.priority());
        Self {
            inner,
            interceptors,
            metrics,
        }
    }

    pub fn inner(&self) -> &Arc<dyn Queue> {
        &self.inner
    }

    async fn should_skip_poll(&self) -> bool {
        for interceptor in self.interceptors_of(InterceptorType::Queue) {
            match interceptor.intercept_poll().await {
                Ok(true) => {
                    debug!(interceptor = %interceptor.name(), "🚦 Poll intercepted");
                    self.metrics.queue_intercepted(interceptor.name());
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        interceptor = %interceptor.name(),
                        error = %e,
                        "Queue interceptor failed, continuing without interception"
                    );
                    self.metrics.interceptor_error(interceptor.name());
                }
            }
        }
        false
    }

    async fn message_interception(&self, message: &Message) -> Option<(String, InterceptorCallback)> {
        for interceptor in self.interceptors_of(InterceptorType::Message) {
            match interceptor.intercept_message(message).await {
                Ok(Some(callback)) => return Some((interceptor.name().to_string(), callback)),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        interceptor = %interceptor.name(),
                        message = %message,
                        error = %e,
                        "Message interceptor failed, continuing without interception"
                    );
                    self.metrics.interceptor_error(interceptor.name());
                }
            }
        }
        None
    }

    fn interceptors_of(&self, interceptor_type: InterceptorType) -> impl Iterator<Item = &Arc<dyn TrafficShapingInterceptor>> {
        self.interceptors
            .iter()
            .filter(move |i| i.supports(interceptor_type))
    }

    async fn deliver(&self, deliveries: Vec<(Message, Ack)>, callback: PollCallback<'_>) -> usize {
        let mut passed = 0;
        for (message, ack) in deliveries {
            match self.message_interception(&message).await {
                Some((interceptor, intercept)) => {
                    debug!(interceptor = %interceptor, message = %message, "🚦 Message intercepted");
                    self.metrics.message_intercepted(&interceptor);
                    if let Err(e) = intercept(self.inner.clone(), message, ack).await {
                        warn!(interceptor = %interceptor, error = %e, "Interceptor callback failed");
                        self.metrics.interceptor_error(&interceptor);
                    }
                }
                None => {
                    callback(message, ack);
                    passed += 1;
                }
            }
        }
        passed
    }
}

impl fmt::Debug for TrafficShapingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficShapingQueue")
            .field("inner", &self.inner)
            .field("interceptors", &self.interceptors)
            .finish()
    }
}

#[async_trait]
impl Queue for TrafficShapingQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn poll(&self, callback: PollCallback<'_>) -> QueueResult<usize> {
        self.poll_many(1, callback).await
    }

    async fn poll_many(&self, max: usize, callback: PollCallback<'_>) -> QueueResult<usize> {
        if self.should_skip_poll().await {
            return Ok(0);
        }
        let mut deliveries = Vec::new();
        self.inner
            .poll_many(max, &mut |message, ack| deliveries.push((message, ack)))
            .await?;
        Ok(self.deliver(deliveries, callback).await)
    }

    async fn push(&self, message: Message, delay: Duration) -> QueueResult<()> {
        self.inner.push(message, delay).await
    }

    async fn reschedule(&self, message: &Message, delay: Duration) -> QueueResult<()> {
        self.inner.reschedule(message, delay).await
    }

    async fn ensure(&self, message: Message, delay: Duration) -> QueueResult<()> {
        self.inner.ensure(message, delay).await
    }

    async fn retry(&self) -> QueueResult<()> {
        self.inner.retry().await
    }

    async fn read_state(&self) -> QueueResult<QueueState> {
        self.inner.read_state().await
    }

    async fn contains_message(&self, predicate: MessagePredicate<'_>) -> QueueResult<bool> {
        self.inner.contains_message(predicate).await
    }

    fn ack_timeout(&self) -> Duration {
        self.inner.ack_timeout()
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.close().await
    }
}

struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    /// Count one event; false once the budget for the current window is spent
    fn admit(&mut self, max: u32, length: Duration) -> bool {
        if self.started.elapsed() >= length {
            self.started = Instant::now();
            self.count = 0;
        }
        if self.count >= max {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Caps the number of polls per time window across the whole queue
pub struct PollRateLimitInterceptor {
    max_polls: u32,
    window: Duration,
    priority: i32,
    state: Mutex<Window>,
}

impl PollRateLimitInterceptor {
    pub fn new(max_polls: u32, window: Duration) -> Self {
        Self {
            max_polls,
            window,
            priority: 0,
            state: Mutex::new(Window::new()),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for PollRateLimitInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollRateLimitInterceptor")
            .field("max_polls", &self.max_polls)
            .field("window", &self.window)
            .finish()
    }
}

#[async_trait]
impl TrafficShapingInterceptor for PollRateLimitInterceptor {
    fn name(&self) -> &str {
        "pollRateLimit"
    }

    fn supports(&self, interceptor_type: InterceptorType) -> bool {
        interceptor_type == InterceptorType::Queue
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn intercept_poll(&self) -> anyhow::Result<bool> {
        Ok(!self.state.lock().admit(self.max_polls, self.window))
    }
}

/// Per-application message budget; over-budget messages are deferred
pub struct ApplicationRateLimitInterceptor {
    max_messages: u32,
    window: Duration,
    delay: Duration,
    priority: i32,
    windows: DashMap<String, Window>,
}

impl ApplicationRateLimitInterceptor {
    pub fn new(max_messages: u32, window: Duration, delay: Duration) -> Self {
        Self {
            max_messages,
            window,
            delay,
            priority: 0,
            windows: DashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for ApplicationRateLimitInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationRateLimitInterceptor")
            .field("max_messages", &self.max_messages)
            .field("window", &self.window)
            .field("delay", &self.delay)
            .finish()
    }
}

#[async_trait]
impl TrafficShapingInterceptor for ApplicationRateLimitInterceptor {
    fn name(&self) -> &str {
        "applicationRateLimit"
    }

    fn supports(&self, interceptor_type: InterceptorType) -> bool {
        interceptor_type == InterceptorType::Message
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn intercept_message(&self, message: &Message) -> anyhow::Result<Option<InterceptorCallback>> {
        let Some(application) = message.application() else {
            return Ok(None);
        };
        let admitted = self
            .windows
            .entry(application.to_string())
            .or_insert_with(Window::new)
            .admit(self.max_messages, self.window);
        if admitted {
            return Ok(None);
        }

        let delay = self.delay;
        let callback: InterceptorCallback = Box::new(move |queue, message, ack| {
            Box::pin(async move {
                queue.push(message, delay).await?;
                ack.ack().await?;
                Ok(())
            })
        });
        Ok(Some(callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::messaging::ExecutionAddress;
    use crate::models::ExecutionType;
    use crate::queue::{AtomicQueueMetrics, InMemoryQueue};

    #[derive(Debug)]
    struct FailingInterceptor;

    #[async_trait]
    impl TrafficShapingInterceptor for FailingInterceptor {
        fn name(&self) -> &str {
            "failing"
        }
        fn supports(&self, _interceptor_type: InterceptorType) -> bool {
            true
        }
        async fn intercept_poll(&self) -> anyhow::Result<bool> {
            anyhow::bail!("boom")
        }
        async fn intercept_message(&self, _message: &Message) -> anyhow::Result<Option<InterceptorCallback>> {
            anyhow::bail!("boom")
        }
    }

    /// Always skips polls and records that it was asked
    #[derive(Debug)]
    struct SkipPolls {
        name: &'static str,
        priority: i32,
        consulted: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl TrafficShapingInterceptor for SkipPolls {
        fn name(&self) -> &str {
            self.name
        }
        fn supports(&self, interceptor_type: InterceptorType) -> bool {
            interceptor_type == InterceptorType::Queue
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn intercept_poll(&self) -> anyhow::Result<bool> {
            self.consulted.lock().push(self.name);
            Ok(true)
        }
    }

    fn start(application: &str, id: &str) -> Message {
        Message::StartExecution(ExecutionAddress::new(ExecutionType::Pipeline, id, application))
    }

    #[tokio::test]
    async fn test_lowest_priority_poll_interceptor_short_circuits() {
        let inner: Arc<dyn Queue> = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
        let metrics = Arc::new(AtomicQueueMetrics::new());
        let consulted = Arc::new(Mutex::new(Vec::new()));
        let late = SkipPolls {
            name: "late",
            priority: 10,
            consulted: consulted.clone(),
        };
        let early = SkipPolls {
            name: "early",
            priority: 1,
            consulted: consulted.clone(),
        };
        let queue = TrafficShapingQueue::new(inner.clone(), vec![Arc::new(late), Arc::new(early)], metrics.clone());

        queue.push(start("app", "e1"), Duration::ZERO).await.unwrap();
        let mut received = Vec::new();
        let delivered = queue.poll(&mut |m, _a| received.push(m)).await.unwrap();

        assert_eq!(delivered, 0);
        assert!(received.is_empty());
        assert_eq!(*consulted.lock(), vec!["early"]);
        assert_eq!(metrics.snapshot().queue_interceptions, 1);
        assert_eq!(inner.read_state().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_failing_interceptor_does_not_block_delivery() {
        let inner: Arc<dyn Queue> = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
        let metrics = Arc::new(AtomicQueueMetrics::new());
        let queue = TrafficShapingQueue::new(inner, vec![Arc::new(FailingInterceptor)], metrics.clone());

        queue.push(start("app", "e1"), Duration::ZERO).await.unwrap();
        let mut received = Vec::new();
        let delivered = queue.poll(&mut |m, _a| received.push(m)).await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(received, vec![start("app", "e1")]);
        assert_eq!(metrics.snapshot().interceptor_errors, 2);
    }

    #[tokio::test]
    async fn test_application_budget_defers_excess_messages() {
        let inner: Arc<dyn Queue> = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
        let metrics = Arc::new(AtomicQueueMetrics::new());
        let limiter = ApplicationRateLimitInterceptor::new(1, Duration::from_secs(60), Duration::from_secs(30));
        let queue = TrafficShapingQueue::new(inner.clone(), vec![Arc::new(limiter)], metrics.clone());

        queue.push(start("app", "e1"), Duration::ZERO).await.unwrap();
        queue.push(start("app", "e2"), Duration::ZERO).await.unwrap();

        let mut received = Vec::new();
        let delivered = queue.poll_many(2, &mut |m, _a| received.push(m)).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(metrics.snapshot().message_interceptions, 1);

        let state = inner.read_state().await.unwrap();
        assert_eq!(state.depth, 1);
        assert_eq!(state.ready, 0);
    }
}
