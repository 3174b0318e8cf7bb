//! # In-Memory Queue
//!
//! Process-local [`Queue`] backed by an ordered set of
//! `(delivery_ms, sequence, fingerprint)` keys plus fingerprint-indexed maps
//! for queued bodies, in-flight deliveries and attempt counters. All state
//! sits behind one `parking_lot` mutex that is never held across an await;
//! callbacks (poll and dead-letter) always run after the lock is released.

use super::{
    Ack, Acknowledge, DeadMessageCallback, MessagePredicate, PollCallback, Queue, QueueMetrics,
    QueueResult, QueueState,
};
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::messaging::Message;
use crate::queue::metrics::NoopQueueMetrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

struct Queued {
    message: Message,
    delivery_ms: i64,
    seq: u64,
}

struct InFlight {
    message: Message,
    expires_ms: i64,
    token: u64,
}

#[derive(Default)]
struct State {
    ready: BTreeSet<(i64, u64, String)>,
    queued: HashMap<String, Queued>,
    unacked: HashMap<String, InFlight>,
    ack_attempts: HashMap<String, u32>,
    delivery_attempts: HashMap<String, u32>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Insert or move a queued entry; latest push wins
    fn enqueue(&mut self, fingerprint: String, message: Message, delivery_ms: i64) {
        let seq = self.next_seq();
        if let Some(existing) = self.queued.get_mut(&fingerprint) {
            self.ready
                .remove(&(existing.delivery_ms, existing.seq, fingerprint.clone()));
            existing.delivery_ms = delivery_ms;
            existing.seq = seq;
        } else {
            self.queued.insert(
                fingerprint.clone(),
                Queued {
                    message,
                    delivery_ms,
                    seq,
                },
            );
        }
        self.ready.insert((delivery_ms, seq, fingerprint));
    }

    fn forget(&mut self, fingerprint: &str) {
        self.ack_attempts.remove(fingerprint);
        self.delivery_attempts.remove(fingerprint);
    }
}

struct Inner {
    name: String,
    ack_timeout: Duration,
    max_retries: u32,
    max_attempts: Option<u32>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn QueueMetrics>,
    dead_message_handlers: Vec<Arc<dyn DeadMessageCallback>>,
    state: Mutex<State>,
}

#[async_trait]
impl Acknowledge for Inner {
    async fn acknowledge(&self, fingerprint: &str, token: &str) -> QueueResult<()> {
        let mut state = self.state.lock();
        let current = state.unacked.get(fingerprint).map(|f| f.token.to_string());
        if current.as_deref() == Some(token) {
            state.unacked.remove(fingerprint);
            state.forget(fingerprint);
            drop(state);
            self.metrics.message_acked(&self.name);
        } else {
            debug!(
                queue = %self.name,
                fingerprint = %fingerprint,
                "Ignoring ack for a delivery that is no longer in flight"
            );
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                ack_timeout: config.ack_timeout(),
                max_retries: config.max_retries,
                max_attempts: config.max_attempts,
                clock,
                metrics: Arc::new(NoopQueueMetrics),
                dead_message_handlers: Vec::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Builder-style setters; only effective before the queue is shared
    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = metrics;
        } else {
            warn!(queue = %self.inner.name, "Metrics ignored: queue already shared");
        }
        self
    }

    pub fn with_dead_message_handler(mut self, handler: Arc<dyn DeadMessageCallback>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.dead_message_handlers.push(handler);
        } else {
            warn!(queue = %self.inner.name, "Dead message handler ignored: queue already shared");
        }
        self
    }

    fn ack_timeout_for(&self, message: &Message) -> Duration {
        message.ack_timeout_override().unwrap_or(self.inner.ack_timeout)
    }

    fn delay_ms(delay: Duration) -> i64 {
        i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2)
    }

    async fn dead_letter(&self, messages: Vec<Message>) {
        for message in messages {
            warn!(
                queue = %self.inner.name,
                message = %message,
                "💀 Message exhausted its delivery attempts"
            );
            self.inner.metrics.message_dead(&self.inner.name);
            for handler in &self.inner.dead_message_handlers {
                handler.on_dead_message(self, &message).await;
            }
        }
    }
}

impl fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.inner.name)
            .field("ack_timeout", &self.inner.ack_timeout)
            .field("max_retries", &self.inner.max_retries)
            .finish()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn poll(&self, callback: PollCallback<'_>) -> QueueResult<usize> {
        let now = self.inner.clock.now_millis();
        let mut dead = Vec::new();
        let delivery = {
            let mut state = self.inner.state.lock();
            let candidate = state
                .ready
                .iter()
                .take_while(|(delivery_ms, _, _)| *delivery_ms <= now)
                .find(|(_, _, fingerprint)| !state.unacked.contains_key(fingerprint))
                .cloned();

            match candidate {
                None => None,
                Some(key) => {
                    state.ready.remove(&key);
                    let fingerprint = key.2;
                    let queued = state.queued.remove(&fingerprint);
                    match queued {
                        None => None,
                        Some(queued) => {
                            let attempts = state
                                .delivery_attempts
                                .entry(fingerprint.clone())
                                .or_insert(0);
                            *attempts += 1;
                            let attempts = *attempts;

                            if self.inner.max_attempts.is_some_and(|max| attempts > max) {
                                state.forget(&fingerprint);
                                dead.push(queued.message);
                                None
                            } else {
                                let token = state.next_seq();
                                let expires_ms =
                                    now + Self::delay_ms(self.ack_timeout_for(&queued.message));
                                state.unacked.insert(
                                    fingerprint.clone(),
                                    InFlight {
                                        message: queued.message.clone(),
                                        expires_ms,
                                        token,
                                    },
                                );
                                Some((queued.message, fingerprint, token))
                            }
                        }
                    }
                }
            }
        };

        self.dead_letter(dead).await;

        match delivery {
            Some((message, fingerprint, token)) => {
                let target: Arc<dyn Acknowledge> = self.inner.clone();
                callback(message, Ack::new(target, fingerprint, token.to_string()));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn push(&self, message: Message, delay: Duration) -> QueueResult<()> {
        let fingerprint = message.fingerprint();
        let delivery_ms = self.inner.clock.now_millis() + Self::delay_ms(delay);
        self.inner
            .state
            .lock()
            .enqueue(fingerprint, message, delivery_ms);
        self.inner.metrics.message_pushed(&self.inner.name);
        Ok(())
    }

    async fn reschedule(&self, message: &Message, delay: Duration) -> QueueResult<()> {
        let fingerprint = message.fingerprint();
        let delivery_ms = self.inner.clock.now_millis() + Self::delay_ms(delay);
        let mut state = self.inner.state.lock();
        if state.queued.contains_key(&fingerprint) {
            state.enqueue(fingerprint, message.clone(), delivery_ms);
        }
        Ok(())
    }

    async fn ensure(&self, message: Message, delay: Duration) -> QueueResult<()> {
        let fingerprint = message.fingerprint();
        let delivery_ms = self.inner.clock.now_millis() + Self::delay_ms(delay);
        let pushed = {
            let mut state = self.inner.state.lock();
            if state.queued.contains_key(&fingerprint) || state.unacked.contains_key(&fingerprint) {
                false
            } else {
                state.enqueue(fingerprint, message, delivery_ms);
                true
            }
        };
        if pushed {
            self.inner.metrics.message_pushed(&self.inner.name);
        }
        Ok(())
    }

    async fn retry(&self) -> QueueResult<()> {
        let now = self.inner.clock.now_millis();
        let mut dead = Vec::new();
        let mut retried = 0;
        {
            let mut state = self.inner.state.lock();
            let expired: Vec<String> = state
                .unacked
                .iter()
                .filter(|(_, f)| f.expires_ms <= now)
                .map(|(fingerprint, _)| fingerprint.clone())
                .collect();

            for fingerprint in expired {
                let Some(in_flight) = state.unacked.remove(&fingerprint) else {
                    continue;
                };
                let attempts = state.ack_attempts.get(&fingerprint).copied().unwrap_or(0);
                if attempts >= self.inner.max_retries {
                    if let Some(queued) = state.queued.remove(&fingerprint) {
                        state
                            .ready
                            .remove(&(queued.delivery_ms, queued.seq, fingerprint.clone()));
                    }
                    state.forget(&fingerprint);
                    dead.push(in_flight.message);
                } else {
                    state.ack_attempts.insert(fingerprint.clone(), attempts + 1);
                    state.enqueue(fingerprint, in_flight.message, now);
                    retried += 1;
                }
            }
        }

        for _ in 0..retried {
            self.inner.metrics.message_retried(&self.inner.name);
        }
        if retried > 0 {
            debug!(queue = %self.inner.name, retried, "🔁 Re-queued unacknowledged messages");
        }
        self.dead_letter(dead).await;
        Ok(())
    }

    async fn read_state(&self) -> QueueResult<QueueState> {
        let now = self.inner.clock.now_millis();
        let state = self.inner.state.lock();
        Ok(QueueState {
            depth: state.queued.len(),
            ready: state
                .ready
                .iter()
                .take_while(|(delivery_ms, _, _)| *delivery_ms <= now)
                .count(),
            unacked: state.unacked.len(),
            orphaned: 0,
        })
    }

    async fn contains_message(&self, predicate: MessagePredicate<'_>) -> QueueResult<bool> {
        let state = self.inner.state.lock();
        Ok(state.queued.values().any(|q| predicate(&q.message))
            || state.unacked.values().any(|f| predicate(&f.message)))
    }

    fn ack_timeout(&self) -> Duration {
        self.inner.ack_timeout
    }
}
