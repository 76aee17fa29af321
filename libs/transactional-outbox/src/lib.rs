//! # Transactional Outbox Pattern Implementation
//!
//! This library implements the Transactional Outbox pattern that §4.1 of the
//! core's contract depends on: an aggregate mutation and the integration
//! events it produces commit in the same database transaction, or neither
//! does. A separate background processor is the only thing allowed to
//! publish those events to the bus.
//!
//! ## Usage Example
//!
//! ### 1. Insert data and event in same transaction
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxMessage, OutboxRepository, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//! use chrono::Utc;
//!
//! async fn create_order(
//!     pool: &PgPool,
//!     outbox_repo: &SqlxOutboxRepository,
//!     order_id: Uuid,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query!("INSERT INTO orders (id) VALUES ($1)", order_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let message = OutboxMessage {
//!         id: Uuid::new_v4(),
//!         aggregate_id: order_id,
//!         event_type: "OrderCreated".to_string(),
//!         payload: serde_json::json!({ "orderId": order_id }),
//!         occurred_at: Utc::now(),
//!         correlation_id: Uuid::new_v4().to_string(),
//!         processed_at: None,
//!         retry_count: 0,
//!         last_error: None,
//!     };
//!
//!     outbox_repo.insert(&mut tx, &message).await?;
//!     tx.commit().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Start the background processor
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxProcessor, SqlxOutboxRepository, KafkaOutboxPublisher};
//! use rdkafka::producer::FutureProducer;
//! use rdkafka::ClientConfig;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect("postgresql://localhost/commerce").await?;
//!
//!     let producer: FutureProducer = ClientConfig::new()
//!         .set("bootstrap.servers", "localhost:9092")
//!         .set("enable.idempotence", "true")
//!         .set("acks", "all")
//!         .set("max.in.flight.requests.per.connection", "5")
//!         .create()?;
//!
//!     let repository = Arc::new(SqlxOutboxRepository::new(pool, "order-service".to_string()));
//!     let publisher = Arc::new(KafkaOutboxPublisher::new(producer, "domain".to_string(), "order-service".to_string()));
//!
//!     let processor = OutboxProcessor::new(repository, publisher, 100, Duration::from_secs(1), 5);
//!     processor.start().await?;
//!
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod macros;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// Bounded by spec §3: once a row has failed this many publish attempts
/// without success, the processor stops retrying it and routes it to the DLQ.
pub const MAX_RETRIES: i32 = 5;

/// An event persisted in the outbox table alongside the aggregate mutation
/// that produced it. `payload` is the serialized `EventEnvelope<T>` from
/// `event-envelope`; the outbox itself is payload-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    /// The aggregate this event is about; also the bus partition key.
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
    /// Set at most once. A tombstone value (rather than a normal publish
    /// timestamp) marks a row that was quarantined instead of delivered.
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

/// What the outbox processor hands to the DLQ when a row exhausts its
/// retry budget. Defined here (rather than depending on `dead-letter-queue`
/// directly) so the two crates don't form a cycle; a service wires a
/// `dead_letter_queue::DlqRepository`-backed adapter in at startup.
#[derive(Debug, Clone)]
pub struct QuarantineRequest {
    pub message_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub error_message: String,
    pub attempt_count: i32,
}

/// Sink the outbox processor hands exhausted rows to. Implemented by an
/// adapter over `dead_letter_queue::DlqRepository` in each service.
#[async_trait]
pub trait DlqSink: Send + Sync {
    async fn quarantine(&self, request: QuarantineRequest) -> OutboxResult<()>;
}

/// Repository trait for managing outbox rows in the database.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new message into the outbox within a transaction. MUST be
    /// called within the same transaction as the aggregate mutation.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> OutboxResult<()>;

    /// Select up to `limit` unprocessed, not-yet-exhausted rows, row-locked
    /// against concurrent processors (`FOR UPDATE SKIP LOCKED`), ordered by
    /// `occurred_at` so per-aggregate FIFO order is preserved.
    async fn fetch_and_lock_batch(&self, limit: i64) -> OutboxResult<Vec<OutboxMessage>>;

    /// Mark a row as successfully delivered.
    async fn mark_published(&self, message_id: Uuid) -> OutboxResult<()>;

    /// Record a failed publish attempt: increments `retry_count`, stores
    /// `last_error`. The row remains eligible for the next poll.
    async fn mark_failed(&self, message_id: Uuid, error: &str) -> OutboxResult<()>;

    /// Stamp `processed_at` with a tombstone so a quarantined row is no
    /// longer selected by future polls.
    async fn mark_quarantined(&self, message_id: Uuid) -> OutboxResult<()>;

    /// Delete processed rows older than `retention`. Used by the scheduled
    /// cleanup task (default TTL 7 days, per spec §4.1).
    async fn purge_processed_older_than(&self, retention: Duration) -> OutboxResult<u64>;

    /// Pending count and oldest-pending age in seconds (0 if none pending).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-backed `OutboxRepository` over a `PostgreSQL` `outbox_messages` table.
pub struct SqlxOutboxRepository {
    pool: PgPool,
    service_name: String,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool, service_name: String) -> Self {
        Self { pool, service_name }
    }

    /// Replay messages created since `ts` by resetting `processed_at` and
    /// retry counters for an operational backfill.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = NULL, retry_count = 0, last_error = NULL
            WHERE occurred_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("failed to replay outbox messages since timestamp")?;

        Ok(res.rows_affected())
    }

    /// Replay messages by id range (inclusive).
    pub async fn replay_range(&self, from_id: Uuid, to_id: Uuid) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = NULL, retry_count = 0, last_error = NULL
            WHERE id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await
        .context("failed to replay outbox messages by id range")?;

        Ok(res.rows_affected())
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, sqlx::Error> {
        Ok(OutboxMessage {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            correlation_id: row.try_get("correlation_id")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, aggregate_id, event_type, payload, occurred_at,
                correlation_id, processed_at, retry_count, last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(message.id)
        .bind(message.aggregate_id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.occurred_at)
        .bind(&message.correlation_id)
        .bind(message.processed_at)
        .bind(message.retry_count)
        .bind(&message.last_error)
        .execute(&mut **tx)
        .await
        .context("failed to insert outbox message")?;

        debug!(
            message_id = %message.id,
            event_type = %message.event_type,
            aggregate_id = %message.aggregate_id,
            "message inserted into outbox"
        );

        Ok(())
    }

    async fn fetch_and_lock_batch(&self, limit: i64) -> OutboxResult<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, event_type, payload, occurred_at,
                   correlation_id, processed_at, retry_count, last_error
            FROM outbox_messages
            WHERE processed_at IS NULL AND retry_count < $1
            ORDER BY occurred_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(MAX_RETRIES)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch and lock outbox batch")?;

        rows.iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("failed to parse outbox rows")
            .map_err(Into::into)
    }

    async fn mark_published(&self, message_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET processed_at = NOW() WHERE id = $1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("failed to mark outbox message as published")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET retry_count = retry_count + 1, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to mark outbox message as failed")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn mark_quarantined(&self, message_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET processed_at = NOW() WHERE id = $1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("failed to tombstone quarantined outbox message")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn purge_processed_older_than(&self, retention: Duration) -> OutboxResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(retention.as_secs() as i64);
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE processed_at IS NOT NULL AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("failed to purge processed outbox messages")?;

        Ok(result.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(occurred_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_messages
            WHERE processed_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to compute outbox pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

/// Publisher trait over the bus. Implementations should treat a successful
/// return as a broker ack, not merely a local enqueue.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, message: &OutboxMessage) -> OutboxResult<()>;
}

/// Kafka-backed `OutboxPublisher`. Topic is `"<prefix>.<service>.events"`
/// (spec §6); partition key is `aggregate_id` so per-aggregate ordering
/// survives the trip through the broker.
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    topic_prefix: String,
    service_name: String,
}

impl KafkaOutboxPublisher {
    /// `producer` MUST have `enable.idempotence=true` and `acks=all`.
    pub fn new(producer: FutureProducer, topic_prefix: String, service_name: String) -> Self {
        Self {
            producer,
            topic_prefix,
            service_name,
        }
    }

    fn topic(&self) -> String {
        format!("{}.{}.events", self.topic_prefix, self.service_name)
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, message: &OutboxMessage) -> OutboxResult<()> {
        let topic = self.topic();
        let payload_str = serde_json::to_string(&message.payload)
            .context("failed to serialize outbox payload")?;

        let event_id_str = message.id.to_string();
        let timestamp_str = message.occurred_at.to_rfc3339();
        let partition_key = message.aggregate_id.to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event-type",
                value: Some(message.event_type.as_bytes()),
            })
            .insert(Header {
                key: "event-id",
                value: Some(event_id_str.as_bytes()),
            })
            .insert(Header {
                key: "timestamp",
                value: Some(timestamp_str.as_bytes()),
            });

        let record = FutureRecord::to(&topic)
            .key(&partition_key)
            .payload(&payload_str)
            .headers(headers);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(err, _)| OutboxError::PublishFailed(format!("kafka publish failed: {err}")))?;

        info!(
            message_id = %message.id,
            event_type = %message.event_type,
            topic = %topic,
            "message published to bus"
        );

        Ok(())
    }
}

/// Background processor that drains the outbox onto the bus.
///
/// - at most `max_retries` publish attempts per row before quarantine
/// - exponential backoff `min(30s, 1s * 2^retry_count)` between attempts
/// - rows that exhaust the budget are handed to `dlq` and tombstoned so
///   they are never selected again
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher, D: DlqSink> {
    repository: Arc<R>,
    publisher: Arc<P>,
    dlq: Option<Arc<D>>,
    batch_size: i64,
    poll_interval: Duration,
    max_retries: i32,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher, D: DlqSink> OutboxProcessor<R, P, D> {
    pub fn new(
        repository: Arc<R>,
        publisher: Arc<P>,
        batch_size: i64,
        poll_interval: Duration,
        max_retries: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            dlq: None,
            batch_size,
            poll_interval,
            max_retries,
            metrics: None,
        }
    }

    pub fn with_dlq(mut self, dlq: Arc<D>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn with_metrics(mut self, metrics: crate::metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the processor loop. Intended to be spawned as a background task;
    /// returns only if a poll iteration can't even begin (never in practice,
    /// since all per-row errors are caught and logged).
    pub async fn start(&self) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            max_retries = self.max_retries,
            "outbox processor starting"
        );

        loop {
            match self.process_batch().await {
                Ok(count) if count > 0 => info!(published_count = count, "published outbox batch"),
                Ok(_) => debug!("no outbox messages to publish"),
                Err(e) => error!(error = ?e, "outbox processor iteration failed"),
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn process_batch(&self) -> OutboxResult<i32> {
        let messages = self.repository.fetch_and_lock_batch(self.batch_size).await?;
        let mut published_count = 0;

        for message in messages {
            if message.retry_count >= self.max_retries {
                self.quarantine(&message).await;
                continue;
            }

            let backoff = self.backoff_for(message.retry_count);
            if backoff.as_secs() > 0 {
                tokio::time::sleep(backoff).await;
            }

            match self.publisher.publish(&message).await {
                Ok(()) => {
                    if let Err(e) = self.repository.mark_published(message.id).await {
                        error!(message_id = %message.id, error = ?e, "delivered to bus but failed to mark published");
                    } else {
                        published_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                }
                Err(e) => {
                    warn!(message_id = %message.id, retry_count = message.retry_count, error = ?e, "outbox publish failed");
                    if let Err(mark_err) = self.repository.mark_failed(message.id, &e.to_string()).await {
                        error!(message_id = %message.id, error = ?mark_err, "failed to record outbox publish failure");
                    }
                    // If this attempt exhausted the budget, quarantine on the next poll
                    // rather than here: mark_failed already committed the incremented
                    // retry_count, and the row will be re-selected with it visible.
                }
            }
        }

        Ok(published_count)
    }

    async fn quarantine(&self, message: &OutboxMessage) {
        warn!(
            message_id = %message.id,
            event_type = %message.event_type,
            retry_count = message.retry_count,
            last_error = ?message.last_error,
            "outbox message exceeded max retries, quarantining to DLQ"
        );

        if let Some(dlq) = &self.dlq {
            let request = QuarantineRequest {
                message_id: message.id,
                event_type: message.event_type.clone(),
                payload: message.payload.clone(),
                topic: format!("outbox:{}", message.event_type),
                error_message: message
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "max retries exceeded".to_string()),
                attempt_count: message.retry_count,
            };
            if let Err(e) = dlq.quarantine(request).await {
                error!(message_id = %message.id, error = ?e, "failed to quarantine outbox message to DLQ");
                return;
            }
        }

        if let Err(e) = self.repository.mark_quarantined(message.id).await {
            error!(message_id = %message.id, error = ?e, "failed to tombstone quarantined outbox message");
        } else if let Some(metrics) = &self.metrics {
            metrics.quarantined.inc();
        }
    }

    /// `min(30s, 1s * 2^retry_count)`, per spec §4.1.
    fn backoff_for(&self, retry_count: i32) -> Duration {
        const CAP_SECS: u64 = 30;
        let secs = 1u64.saturating_mul(2u64.saturating_pow(retry_count.max(0) as u32));
        Duration::from_secs(secs.min(CAP_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDlq;

    #[async_trait]
    impl DlqSink for NoopDlq {
        async fn quarantine(&self, _request: QuarantineRequest) -> OutboxResult<()> {
            Ok(())
        }
    }

    fn processor() -> OutboxProcessor<SqlxOutboxRepository, KafkaOutboxPublisher, NoopDlq> {
        let repo = Arc::new(SqlxOutboxRepository::new(
            PgPool::connect_lazy("postgresql://localhost/test").unwrap(),
            "order-service".to_string(),
        ));
        let producer =
            rdkafka::producer::FutureProducer::from_config(&rdkafka::ClientConfig::new()).unwrap();
        let publisher = Arc::new(KafkaOutboxPublisher::new(
            producer,
            "domain".to_string(),
            "order-service".to_string(),
        ));
        OutboxProcessor::new(repo, publisher, 100, Duration::from_secs(1), MAX_RETRIES)
    }

    #[test]
    fn backoff_is_capped_exponential() {
        let p = processor();
        assert_eq!(p.backoff_for(0).as_secs(), 1);
        assert_eq!(p.backoff_for(1).as_secs(), 2);
        assert_eq!(p.backoff_for(2).as_secs(), 4);
        assert_eq!(p.backoff_for(3).as_secs(), 8);
        assert_eq!(p.backoff_for(4).as_secs(), 16);
        assert_eq!(p.backoff_for(5).as_secs(), 30); // capped below the raw 32s
        assert_eq!(p.backoff_for(10).as_secs(), 30);
    }

    #[test]
    fn topic_naming_follows_prefix_service_events() {
        let producer =
            rdkafka::producer::FutureProducer::from_config(&rdkafka::ClientConfig::new()).unwrap();
        let publisher = KafkaOutboxPublisher::new(
            producer,
            "domain".to_string(),
            "inventory-service".to_string(),
        );
        assert_eq!(publisher.topic(), "domain.inventory-service.events");
    }
}
