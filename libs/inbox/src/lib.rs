//! # Inbox Pattern Implementation
//!
//! Makes consumption of an integration event **exactly-once from this
//! consumer's perspective**, the mirror image of `transactional-outbox` on
//! the consuming side. At-least-once delivery from the bus means every
//! handler must tolerate redelivery; the inbox is what turns "tolerate" into
//! "ignore safely".
//!
//! ## Idempotency key
//!
//! The uniqueness invariant is the *composite* key `(event_id, consumer)`,
//! not `event_id` alone: the same event is legitimately consumed once each
//! by every consumer group that subscribes to it (Inventory and
//! Notification both see `OrderCreated`), but each consumer processes it at
//! most once. `consumer` must be a non-empty, stable identity for the
//! consumer group — see [`InboxError::MissingConsumer`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use inbox::{consume, ConsumeOutcome, SqlxInboxRepository};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//!
//! # async fn example(pool: PgPool, repo: SqlxInboxRepository) -> Result<(), Box<dyn std::error::Error>> {
//! let event_id = Uuid::new_v4();
//!
//! let outcome = consume(&repo, &pool, event_id, "inventory-service", |tx| async move {
//!     // Reserve stock, persist outbox rows, etc. -- all within `tx`.
//!     let _ = tx;
//!     Ok(())
//! })
//! .await?;
//!
//! match outcome {
//!     ConsumeOutcome::Processed => println!("handled"),
//!     ConsumeOutcome::Duplicate => println!("already handled, skipped"),
//!     ConsumeOutcome::Failed { retry_count, poisoned } => {
//!         println!("handler failed (attempt {retry_count}), poisoned={poisoned}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod error;

pub use error::{InboxError, InboxResult};

/// Spec §4.2: after this many failed attempts the row stays `Failed` and the
/// event is routed to DLQ by the caller; further redeliveries are swallowed.
pub const MAX_HANDLER_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum InboxStatus {
    Received,
    Processed,
    Failed,
}

impl InboxStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            InboxStatus::Received => "Received",
            InboxStatus::Processed => "Processed",
            InboxStatus::Failed => "Failed",
        }
    }

    fn from_db_str(s: &str) -> Self {
        match s {
            "Processed" => InboxStatus::Processed,
            "Failed" => InboxStatus::Failed,
            _ => InboxStatus::Received,
        }
    }
}

/// A row in the inbox table, keyed by `(event_id, consumer)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub event_id: Uuid,
    pub consumer: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: InboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

/// What [`InboxRepository::mark_received`] decided after attempting the
/// insert, given whatever row (if any) already existed for this key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveDecision {
    /// No prior row. Handler should run.
    New,
    /// Prior row is `Received` or `Failed` with retries remaining. Handler
    /// should run again.
    Retry { retry_count: i32 },
    /// Prior row is `Processed`. Handler must NOT run; redelivery absorbed.
    Duplicate,
    /// Prior row is `Failed` with no retries left. Caller must not run the
    /// handler and should treat this as already routed to DLQ.
    Poisoned,
}

/// The outcome of a full [`consume`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Processed,
    Duplicate,
    Failed { retry_count: i32, poisoned: bool },
}

#[async_trait]
pub trait InboxRepository: Send + Sync {
    /// Attempt to insert `(event_id, consumer)` as `Received`. On conflict,
    /// locks and inspects the existing row to decide how to proceed.
    async fn mark_received(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        consumer: &str,
    ) -> InboxResult<ReceiveDecision>;

    async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        consumer: &str,
    ) -> InboxResult<()>;

    /// Increments `retry_count`, records `last_error`, sets status `Failed`.
    /// Returns the new `retry_count`.
    async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        consumer: &str,
        error: &str,
    ) -> InboxResult<i32>;

    async fn get(&self, event_id: Uuid, consumer: &str) -> InboxResult<Option<InboxMessage>>;

    async fn purge_older_than(&self, retention: Duration) -> InboxResult<u64>;
}

pub struct SqlxInboxRepository {
    pool: PgPool,
}

impl SqlxInboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxRepository for SqlxInboxRepository {
    async fn mark_received(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        consumer: &str,
    ) -> InboxResult<ReceiveDecision> {
        if consumer.is_empty() {
            return Err(InboxError::MissingConsumer);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO inbox_messages (event_id, consumer, received_at, status, retry_count)
            VALUES ($1, $2, NOW(), 'Received', 0)
            ON CONFLICT (event_id, consumer) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(consumer)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() > 0 {
            debug!(%event_id, consumer, "inbox row inserted as Received");
            return Ok(ReceiveDecision::New);
        }

        let row = sqlx::query(
            r#"
            SELECT status, retry_count
            FROM inbox_messages
            WHERE event_id = $1 AND consumer = $2
            FOR UPDATE
            "#,
        )
        .bind(event_id)
        .bind(consumer)
        .fetch_one(&mut **tx)
        .await?;

        let status = InboxStatus::from_db_str(row.try_get::<String, _>("status")?.as_str());
        let retry_count: i32 = row.try_get("retry_count")?;

        match status {
            InboxStatus::Processed => Ok(ReceiveDecision::Duplicate),
            InboxStatus::Received => Ok(ReceiveDecision::Retry { retry_count }),
            InboxStatus::Failed if retry_count < MAX_HANDLER_RETRIES => {
                Ok(ReceiveDecision::Retry { retry_count })
            }
            InboxStatus::Failed => Ok(ReceiveDecision::Poisoned),
        }
    }

    async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        consumer: &str,
    ) -> InboxResult<()> {
        sqlx::query(
            r#"
            UPDATE inbox_messages
            SET status = 'Processed', processed_at = NOW()
            WHERE event_id = $1 AND consumer = $2
            "#,
        )
        .bind(event_id)
        .bind(consumer)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        consumer: &str,
        error: &str,
    ) -> InboxResult<i32> {
        let row = sqlx::query(
            r#"
            UPDATE inbox_messages
            SET status = 'Failed', retry_count = retry_count + 1, last_error = $3
            WHERE event_id = $1 AND consumer = $2
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .bind(consumer)
        .bind(error)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.try_get("retry_count")?)
    }

    async fn get(&self, event_id: Uuid, consumer: &str) -> InboxResult<Option<InboxMessage>> {
        let row = sqlx::query(
            r#"
            SELECT event_id, consumer, received_at, processed_at, status, retry_count, last_error
            FROM inbox_messages
            WHERE event_id = $1 AND consumer = $2
            "#,
        )
        .bind(event_id)
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(InboxMessage {
                event_id: r.try_get("event_id")?,
                consumer: r.try_get("consumer")?,
                received_at: r.try_get("received_at")?,
                processed_at: r.try_get("processed_at")?,
                status: InboxStatus::from_db_str(r.try_get::<String, _>("status")?.as_str()),
                retry_count: r.try_get("retry_count")?,
                last_error: r.try_get("last_error")?,
            })
        })
        .transpose()
        .map_err(InboxError::Database)
    }

    async fn purge_older_than(&self, retention: Duration) -> InboxResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(retention.as_secs() as i64);
        let result = sqlx::query(
            "DELETE FROM inbox_messages WHERE processed_at IS NOT NULL AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Drive one event through the inbox: mark received, run `handler` inside
/// the same transaction as any aggregate/outbox mutations it performs, then
/// mark processed (commit everything together) or failed (roll the handler
/// back, then persist the failure marker in its own transaction so retries
/// are accounted for even though the handler's effects were not).
pub async fn consume<R, H, Fut>(
    repo: &R,
    pool: &PgPool,
    event_id: Uuid,
    consumer: &str,
    handler: H,
) -> InboxResult<ConsumeOutcome>
where
    R: InboxRepository,
    H: FnOnce(&mut Transaction<'_, Postgres>) -> Fut,
    Fut: Future<Output = Result<(), anyhow::Error>>,
{
    if consumer.is_empty() {
        return Err(InboxError::MissingConsumer);
    }

    let mut tx = pool.begin().await?;
    let decision = repo.mark_received(&mut tx, event_id, consumer).await?;

    match decision {
        ReceiveDecision::Duplicate => {
            tx.rollback().await?;
            debug!(%event_id, consumer, "duplicate delivery absorbed by inbox");
            return Ok(ConsumeOutcome::Duplicate);
        }
        ReceiveDecision::Poisoned => {
            tx.rollback().await?;
            warn!(%event_id, consumer, "redelivery of a poisoned event swallowed");
            return Err(InboxError::Poison {
                event_id,
                consumer: consumer.to_string(),
            });
        }
        ReceiveDecision::New | ReceiveDecision::Retry { .. } => {}
    }

    match handler(&mut tx).await {
        Ok(()) => {
            repo.mark_processed(&mut tx, event_id, consumer).await?;
            tx.commit().await?;
            info!(%event_id, consumer, "event processed");
            Ok(ConsumeOutcome::Processed)
        }
        Err(e) => {
            // Roll back whatever the handler attempted; the failure marker
            // is recorded in a fresh transaction so the retry count survives.
            tx.rollback().await?;

            let mut marker_tx = pool.begin().await?;
            let retry_count = repo
                .mark_failed(&mut marker_tx, event_id, consumer, &e.to_string())
                .await?;
            marker_tx.commit().await?;

            let poisoned = retry_count >= MAX_HANDLER_RETRIES;
            warn!(%event_id, consumer, retry_count, poisoned, error = ?e, "handler failed");
            Ok(ConsumeOutcome::Failed {
                retry_count,
                poisoned,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_string() {
        for status in [InboxStatus::Received, InboxStatus::Processed, InboxStatus::Failed] {
            assert_eq!(InboxStatus::from_db_str(status.as_db_str()), status);
        }
    }

    #[test]
    fn unknown_db_string_defaults_to_received() {
        assert_eq!(InboxStatus::from_db_str("garbage"), InboxStatus::Received);
    }
}
