//! # PostgreSQL Queue
//!
//! Durable [`Queue`] on three tables sharing a validated name prefix:
//!
//! - `<prefix>_messages`: message bodies and attempt counters by fingerprint
//! - `<prefix>_queue`: pending deliveries (`fingerprint`, `delivery_ms`)
//! - `<prefix>_unacked`: in-flight deliveries (`fingerprint`, `expiry_ms`, `token`)
//!
//! A delivery is claimed by deleting its `_queue` row through a
//! `FOR UPDATE SKIP LOCKED` sub-select inside the same transaction that
//! records the `_unacked` row, so two pollers can never claim the same entry.
//! Acks delete the `_unacked` row only when the delivery token still matches.

use super::{
    Ack, Acknowledge, DeadMessageCallback, MessagePredicate, PollCallback, Queue, QueueError,
    QueueMetrics, QueueResult, QueueState,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{DatabaseConfig, QueueConfig};
use crate::messaging::Message;
use crate::queue::metrics::NoopQueueMetrics;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

struct Tables {
    messages: String,
    queue: String,
    unacked: String,
}

impl Tables {
    fn new(prefix: &str) -> QueueResult<Self> {
        let valid = !prefix.is_empty()
            && prefix.len() <= 48
            && prefix
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(QueueError::invalid_queue_name(
                prefix,
                "table prefix must be an ASCII identifier of at most 48 characters",
            ));
        }
        Ok(Self {
            messages: format!("{prefix}_messages"),
            queue: format!("{prefix}_queue"),
            unacked: format!("{prefix}_unacked"),
        })
    }
}

struct PgInner {
    pool: PgPool,
    tables: Tables,
    name: String,
    metrics: Arc<dyn QueueMetrics>,
}

#[async_trait]
impl Acknowledge for PgInner {
    async fn acknowledge(&self, fingerprint: &str, token: &str) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(&format!(
            "DELETE FROM {} WHERE fingerprint = $1 AND token = $2",
            self.tables.unacked
        ))
        .bind(fingerprint)
        .bind(token)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if removed == 0 {
            debug!(queue = %self.name, fingerprint = %fingerprint, "Ignoring stale ack");
            tx.commit().await?;
            return Ok(());
        }

        sqlx::query(&format!(
            "DELETE FROM {m} WHERE fingerprint = $1 \
             AND NOT EXISTS (SELECT 1 FROM {q} WHERE fingerprint = $1)",
            m = self.tables.messages,
            q = self.tables.queue
        ))
        .bind(fingerprint)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "UPDATE {} SET ack_attempts = 0, delivery_attempts = 0 WHERE fingerprint = $1",
            self.tables.messages
        ))
        .bind(fingerprint)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.metrics.message_acked(&self.name);
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresQueue {
    inner: Arc<PgInner>,
    ack_timeout: Duration,
    max_retries: u32,
    max_attempts: Option<u32>,
    clock: Arc<dyn Clock>,
    dead_message_handlers: Vec<Arc<dyn DeadMessageCallback>>,
}

impl PostgresQueue {
    /// Connect and create the backing tables when missing
    pub async fn connect(database: &DatabaseConfig, queue: &QueueConfig) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .acquire_timeout(database.acquire_timeout())
            .connect(&database.url)
            .await?;
        let this = Self::with_pool(pool, &database.table_prefix, queue)?;
        this.ensure_schema().await?;
        info!(queue = %queue.name, prefix = %database.table_prefix, "✅ PostgreSQL queue ready");
        Ok(this)
    }

    pub fn with_pool(pool: PgPool, table_prefix: &str, queue: &QueueConfig) -> QueueResult<Self> {
        Ok(Self {
            inner: Arc::new(PgInner {
                pool,
                tables: Tables::new(table_prefix)?,
                name: queue.name.clone(),
                metrics: Arc::new(NoopQueueMetrics),
            }),
            ack_timeout: queue.ack_timeout(),
            max_retries: queue.max_retries,
            max_attempts: queue.max_attempts,
            clock: Arc::new(SystemClock),
            dead_message_handlers: Vec::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = metrics;
        }
        self
    }

    pub fn with_dead_message_handler(mut self, handler: Arc<dyn DeadMessageCallback>) -> Self {
        self.dead_message_handlers.push(handler);
        self
    }

    pub async fn ensure_schema(&self) -> QueueResult<()> {
        let t = &self.inner.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 fingerprint TEXT PRIMARY KEY, \
                 body JSONB NOT NULL, \
                 ack_attempts INTEGER NOT NULL DEFAULT 0, \
                 delivery_attempts INTEGER NOT NULL DEFAULT 0, \
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT now())",
                t.messages
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 fingerprint TEXT PRIMARY KEY, \
                 delivery_ms BIGINT NOT NULL)",
                t.queue
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {q}_delivery_idx ON {q} (delivery_ms)",
                q = t.queue
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 fingerprint TEXT PRIMARY KEY, \
                 expiry_ms BIGINT NOT NULL, \
                 token TEXT NOT NULL)",
                t.unacked
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.inner.pool).await?;
        }
        Ok(())
    }

    fn delay_ms(delay: Duration) -> i64 {
        i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2)
    }

    fn timeout_ms_for(&self, message: &Message) -> i64 {
        Self::delay_ms(message.ack_timeout_override().unwrap_or(self.ack_timeout))
    }

    async fn upsert(&self, message: &Message, delivery_ms: i64, only_if_absent: bool) -> QueueResult<bool> {
        let t = &self.inner.tables;
        let fingerprint = message.fingerprint();
        let body = serde_json::to_value(message)?;
        let mut tx = self.inner.pool.begin().await?;

        if only_if_absent {
            let exists: bool = sqlx::query_scalar(&format!(
                "SELECT EXISTS (SELECT 1 FROM {q} WHERE fingerprint = $1) \
                 OR EXISTS (SELECT 1 FROM {u} WHERE fingerprint = $1)",
                q = t.queue,
                u = t.unacked
            ))
            .bind(&fingerprint)
            .fetch_one(&mut *tx)
            .await?;
            if exists {
                tx.commit().await?;
                return Ok(false);
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {} (fingerprint, body) VALUES ($1, $2) \
             ON CONFLICT (fingerprint) DO UPDATE SET updated_at = now()",
            t.messages
        ))
        .bind(&fingerprint)
        .bind(&body)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (fingerprint, delivery_ms) VALUES ($1, $2) \
             ON CONFLICT (fingerprint) DO UPDATE SET delivery_ms = EXCLUDED.delivery_ms",
            t.queue
        ))
        .bind(&fingerprint)
        .bind(delivery_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn dead_letter(&self, messages: Vec<Message>) {
        for message in messages {
            warn!(queue = %self.inner.name, message = %message, "💀 Message exhausted its delivery attempts");
            self.inner.metrics.message_dead(&self.inner.name);
            for handler in &self.dead_message_handlers {
                handler.on_dead_message(self, &message).await;
            }
        }
    }
}

impl fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("name", &self.inner.name)
            .field("messages_table", &self.inner.tables.messages)
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self, callback), fields(queue = %self.inner.name))]
    async fn poll(&self, callback: PollCallback<'_>) -> QueueResult<usize> {
        let t = &self.inner.tables;
        let now = self.clock.now_millis();
        let mut tx = self.inner.pool.begin().await?;

        let claimed: Option<String> = sqlx::query_scalar(&format!(
            "WITH next AS (\
               SELECT q.fingerprint FROM {q} q \
               WHERE q.delivery_ms <= $1 \
                 AND NOT EXISTS (SELECT 1 FROM {u} u WHERE u.fingerprint = q.fingerprint) \
               ORDER BY q.delivery_ms \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED) \
             DELETE FROM {q} q USING next WHERE q.fingerprint = next.fingerprint \
             RETURNING q.fingerprint",
            q = t.queue,
            u = t.unacked
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(fingerprint) = claimed else {
            tx.commit().await?;
            return Ok(0);
        };

        let row = sqlx::query(&format!(
            "UPDATE {} SET delivery_attempts = delivery_attempts + 1, updated_at = now() \
             WHERE fingerprint = $1 RETURNING body, delivery_attempts",
            t.messages
        ))
        .bind(&fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            warn!(fingerprint = %fingerprint, "Queue entry without a stored message body, dropping");
            tx.commit().await?;
            return Ok(0);
        };
        let body: serde_json::Value = row.try_get("body")?;
        let delivery_attempts: i32 = row.try_get("delivery_attempts")?;
        let message: Message = serde_json::from_value(body)?;

        if self
            .max_attempts
            .is_some_and(|max| i64::from(delivery_attempts) > i64::from(max))
        {
            sqlx::query(&format!("DELETE FROM {} WHERE fingerprint = $1", t.messages))
                .bind(&fingerprint)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            self.dead_letter(vec![message]).await;
            return Ok(0);
        }

        let token = Uuid::new_v4().to_string();
        sqlx::query(&format!(
            "INSERT INTO {} (fingerprint, expiry_ms, token) VALUES ($1, $2, $3) \
             ON CONFLICT (fingerprint) DO UPDATE SET expiry_ms = EXCLUDED.expiry_ms, token = EXCLUDED.token",
            t.unacked
        ))
        .bind(&fingerprint)
        .bind(now + self.timeout_ms_for(&message))
        .bind(&token)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let target: Arc<dyn Acknowledge> = self.inner.clone();
        callback(message, Ack::new(target, fingerprint, token));
        Ok(1)
    }

    async fn push(&self, message: Message, delay: Duration) -> QueueResult<()> {
        let delivery_ms = self.clock.now_millis() + Self::delay_ms(delay);
        self.upsert(&message, delivery_ms, false).await?;
        self.inner.metrics.message_pushed(&self.inner.name);
        Ok(())
    }

    async fn reschedule(&self, message: &Message, delay: Duration) -> QueueResult<()> {
        let delivery_ms = self.clock.now_millis() + Self::delay_ms(delay);
        sqlx::query(&format!(
            "UPDATE {} SET delivery_ms = $2 WHERE fingerprint = $1",
            self.inner.tables.queue
        ))
        .bind(message.fingerprint())
        .bind(delivery_ms)
        .execute(&self.inner.pool)
        .await?;
        Ok(())
    }

    async fn ensure(&self, message: Message, delay: Duration) -> QueueResult<()> {
        let delivery_ms = self.clock.now_millis() + Self::delay_ms(delay);
        if self.upsert(&message, delivery_ms, true).await? {
            self.inner.metrics.message_pushed(&self.inner.name);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.inner.name))]
    async fn retry(&self) -> QueueResult<()> {
        let t = &self.inner.tables;
        let now = self.clock.now_millis();
        let mut tx = self.inner.pool.begin().await?;

        let expired: Vec<String> = sqlx::query_scalar(&format!(
            "DELETE FROM {} WHERE expiry_ms <= $1 RETURNING fingerprint",
            t.unacked
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut dead = Vec::new();
        let mut retried = 0usize;
        for fingerprint in expired {
            let row = sqlx::query(&format!(
                "SELECT body, ack_attempts FROM {} WHERE fingerprint = $1 FOR UPDATE",
                t.messages
            ))
            .bind(&fingerprint)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else { continue };
            let ack_attempts: i32 = row.try_get("ack_attempts")?;

            if i64::from(ack_attempts) >= i64::from(self.max_retries) {
                let body: serde_json::Value = row.try_get("body")?;
                sqlx::query(&format!("DELETE FROM {} WHERE fingerprint = $1", t.queue))
                    .bind(&fingerprint)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&format!("DELETE FROM {} WHERE fingerprint = $1", t.messages))
                    .bind(&fingerprint)
                    .execute(&mut *tx)
                    .await?;
                match serde_json::from_value::<Message>(body) {
                    Ok(message) => dead.push(message),
                    Err(e) => warn!(fingerprint = %fingerprint, error = %e, "Dead message body could not be decoded"),
                }
            } else {
                sqlx::query(&format!(
                    "UPDATE {} SET ack_attempts = ack_attempts + 1 WHERE fingerprint = $1",
                    t.messages
                ))
                .bind(&fingerprint)
                .execute(&mut *tx)
                .await?;
                sqlx::query(&format!(
                    "INSERT INTO {} (fingerprint, delivery_ms) VALUES ($1, $2) \
                     ON CONFLICT (fingerprint) DO UPDATE SET delivery_ms = LEAST({}.delivery_ms, EXCLUDED.delivery_ms)",
                    t.queue, t.queue
                ))
                .bind(&fingerprint)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                retried += 1;
            }
        }
        tx.commit().await?;

        for _ in 0..retried {
            self.inner.metrics.message_retried(&self.inner.name);
        }
        self.dead_letter(dead).await;
        Ok(())
    }

    async fn read_state(&self) -> QueueResult<QueueState> {
        let t = &self.inner.tables;
        let now = self.clock.now_millis();
        let row = sqlx::query(&format!(
            "SELECT \
               (SELECT COUNT(*) FROM {q}) AS depth, \
               (SELECT COUNT(*) FROM {q} WHERE delivery_ms <= $1) AS ready, \
               (SELECT COUNT(*) FROM {u}) AS unacked, \
               (SELECT COUNT(*) FROM {m} m WHERE NOT EXISTS (SELECT 1 FROM {q} q WHERE q.fingerprint = m.fingerprint) \
                  AND NOT EXISTS (SELECT 1 FROM {u} u WHERE u.fingerprint = m.fingerprint)) AS orphaned",
            q = t.queue,
            u = t.unacked,
            m = t.messages
        ))
        .bind(now)
        .fetch_one(&self.inner.pool)
        .await?;

        let count = |column: &str| -> QueueResult<usize> {
            let value: i64 = row.try_get(column)?;
            Ok(usize::try_from(value).unwrap_or(0))
        };
        Ok(QueueState {
            depth: count("depth")?,
            ready: count("ready")?,
            unacked: count("unacked")?,
            orphaned: count("orphaned")?,
        })
    }

    async fn contains_message(&self, predicate: MessagePredicate<'_>) -> QueueResult<bool> {
        let bodies: Vec<serde_json::Value> = sqlx::query_scalar(&format!(
            "SELECT body FROM {}",
            self.inner.tables.messages
        ))
        .fetch_all(&self.inner.pool)
        .await?;
        Ok(bodies
            .into_iter()
            .filter_map(|body| serde_json::from_value::<Message>(body).ok())
            .any(|message| predicate(&message)))
    }

    fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.pool.close().await;
        Ok(())
    }
}
