//! # Dead-Letter Queue
//!
//! Durable quarantine for messages whose handler exhausted its retry
//! budget, whether that handler lives behind the outbox processor (publish
//! never succeeded) or the inbox (business logic never succeeded). A
//! dead-letter row never disappears silently: status transitions are
//! append-only and the row stays queryable until an operator explicitly
//! resolves or discards it (spec §8 invariant 7).
//!
//! ## Status lifecycle
//!
//! ```text
//! Quarantined --reprocess()--> Reprocessing --success--> Resolved
//!                                   |--failure--> Quarantined
//! Quarantined/Reprocessing --discard()--> Discarded
//! ```
//!
//! `Resolved` and `Discarded` are terminal: [`DlqRepository`] refuses any
//! further transition out of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::future::Future;
use tracing::{info, warn};
use uuid::Uuid;

mod error;

pub use error::{DlqError, DlqResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DlqStatus {
    Quarantined,
    Reprocessing,
    Resolved,
    Discarded,
}

impl DlqStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            DlqStatus::Quarantined => "Quarantined",
            DlqStatus::Reprocessing => "Reprocessing",
            DlqStatus::Resolved => "Resolved",
            DlqStatus::Discarded => "Discarded",
        }
    }

    fn from_db_str(s: &str) -> Self {
        match s {
            "Reprocessing" => DlqStatus::Reprocessing,
            "Resolved" => DlqStatus::Resolved,
            "Discarded" => DlqStatus::Discarded,
            _ => DlqStatus::Quarantined,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, DlqStatus::Resolved | DlqStatus::Discarded)
    }
}

/// A snapshot of a message whose handler exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: Uuid,
    /// The event's own `eventId` where one exists (absent for a raw outbox
    /// row that never acquired an envelope, e.g. a serialization failure).
    pub event_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub failed_at: DateTime<Utc>,
    pub original_topic: String,
    pub consumer: String,
    pub error_kind: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub attempt_count: i32,
    pub status: DlqStatus,
}

/// Filter for [`DlqRepository::list`]. All fields are conjunctive; `None`
/// means "don't filter on this dimension".
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub status: Option<DlqStatus>,
    pub consumer: Option<String>,
    pub event_type: Option<String>,
}

#[async_trait]
pub trait DlqRepository: Send + Sync {
    async fn quarantine(&self, message: DeadLetterMessage) -> DlqResult<Uuid>;
    async fn list(&self, filter: &DlqFilter) -> DlqResult<Vec<DeadLetterMessage>>;
    async fn get(&self, id: Uuid) -> DlqResult<DeadLetterMessage>;
    async fn transition(&self, id: Uuid, to: DlqStatus) -> DlqResult<()>;
}

pub struct SqlxDlqRepository {
    pool: PgPool,
}

impl SqlxDlqRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<DeadLetterMessage, sqlx::Error> {
        Ok(DeadLetterMessage {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            failed_at: row.try_get("failed_at")?,
            original_topic: row.try_get("original_topic")?,
            consumer: row.try_get("consumer")?,
            error_kind: row.try_get("error_kind")?,
            error_message: row.try_get("error_message")?,
            stack_trace: row.try_get("stack_trace")?,
            attempt_count: row.try_get("attempt_count")?,
            status: DlqStatus::from_db_str(row.try_get::<String, _>("status")?.as_str()),
        })
    }
}

#[async_trait]
impl DlqRepository for SqlxDlqRepository {
    async fn quarantine(&self, message: DeadLetterMessage) -> DlqResult<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_messages (
                id, event_id, event_type, payload, failed_at, original_topic,
                consumer, error_kind, error_message, stack_trace, attempt_count, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(message.id)
        .bind(message.event_id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.failed_at)
        .bind(&message.original_topic)
        .bind(&message.consumer)
        .bind(&message.error_kind)
        .bind(&message.error_message)
        .bind(&message.stack_trace)
        .bind(message.attempt_count)
        .bind(message.status.as_db_str())
        .execute(&self.pool)
        .await?;

        warn!(
            id = %message.id,
            event_type = %message.event_type,
            consumer = %message.consumer,
            "message quarantined to dead-letter queue"
        );

        Ok(message.id)
    }

    async fn list(&self, filter: &DlqFilter) -> DlqResult<Vec<DeadLetterMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, event_type, payload, failed_at, original_topic,
                   consumer, error_kind, error_message, stack_trace, attempt_count, status
            FROM dead_letter_messages
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR consumer = $2)
              AND ($3::TEXT IS NULL OR event_type = $3)
            ORDER BY failed_at DESC
            "#,
        )
        .bind(filter.status.map(DlqStatus::as_db_str))
        .bind(&filter.consumer)
        .bind(&filter.event_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(DlqError::from)
    }

    async fn get(&self, id: Uuid) -> DlqResult<DeadLetterMessage> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, event_type, payload, failed_at, original_topic,
                   consumer, error_kind, error_message, stack_trace, attempt_count, status
            FROM dead_letter_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DlqError::NotFound(id))?;

        Self::row_to_message(&row).map_err(DlqError::from)
    }

    async fn transition(&self, id: Uuid, to: DlqStatus) -> DlqResult<()> {
        let current = self.get(id).await?;
        if current.status.is_terminal() {
            return Err(DlqError::Terminal(id));
        }

        sqlx::query("UPDATE dead_letter_messages SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(to.as_db_str())
            .execute(&self.pool)
            .await?;

        info!(%id, from = ?current.status, to = ?to, "dead-letter row transitioned");
        Ok(())
    }
}

/// Move a row to `Reprocessing`, re-deliver it to `redeliver`, then settle
/// it to `Resolved` on success or back to `Quarantined` on failure. Never
/// transitions a terminal row (`Resolved`/`Discarded`).
pub async fn reprocess<R, F, Fut>(repo: &R, id: Uuid, redeliver: F) -> DlqResult<DlqStatus>
where
    R: DlqRepository,
    F: FnOnce(DeadLetterMessage) -> Fut,
    Fut: Future<Output = Result<(), anyhow::Error>>,
{
    let message = repo.get(id).await?;
    if message.status.is_terminal() {
        return Err(DlqError::Terminal(id));
    }

    repo.transition(id, DlqStatus::Reprocessing).await?;

    match redeliver(message).await {
        Ok(()) => {
            repo.transition(id, DlqStatus::Resolved).await?;
            Ok(DlqStatus::Resolved)
        }
        Err(e) => {
            warn!(%id, error = ?e, "dead-letter reprocess attempt failed, returning to Quarantined");
            repo.transition(id, DlqStatus::Quarantined).await?;
            Ok(DlqStatus::Quarantined)
        }
    }
}

/// Permanently discard a row; always legal unless already terminal.
pub async fn discard<R: DlqRepository>(repo: &R, id: Uuid, reason: &str) -> DlqResult<()> {
    info!(%id, reason, "discarding dead-letter row");
    repo.transition(id, DlqStatus::Discarded).await
}

/// Adapter that lets a [`DlqRepository`] serve as the outbox processor's
/// `transactional_outbox::DlqSink`, so the outbox crate never needs to know
/// about this crate's row shape.
pub struct OutboxDlqAdapter<R: DlqRepository> {
    repo: std::sync::Arc<R>,
}

impl<R: DlqRepository> OutboxDlqAdapter<R> {
    pub fn new(repo: std::sync::Arc<R>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<R: DlqRepository> transactional_outbox::DlqSink for OutboxDlqAdapter<R> {
    async fn quarantine(
        &self,
        request: transactional_outbox::QuarantineRequest,
    ) -> transactional_outbox::OutboxResult<()> {
        let message = DeadLetterMessage {
            id: Uuid::new_v4(),
            event_id: Some(request.message_id),
            event_type: request.event_type,
            payload: request.payload,
            failed_at: Utc::now(),
            original_topic: request.topic,
            consumer: "outbox-processor".to_string(),
            error_kind: "Transient".to_string(),
            error_message: request.error_message,
            stack_trace: None,
            attempt_count: request.attempt_count,
            status: DlqStatus::Quarantined,
        };

        DlqRepository::quarantine(&*self.repo, message)
            .await
            .map_err(|e| transactional_outbox::OutboxError::Other(anyhow::anyhow!(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_string() {
        for status in [
            DlqStatus::Quarantined,
            DlqStatus::Reprocessing,
            DlqStatus::Resolved,
            DlqStatus::Discarded,
        ] {
            assert_eq!(DlqStatus::from_db_str(status.as_db_str()), status);
        }
    }

    #[test]
    fn only_resolved_and_discarded_are_terminal() {
        assert!(!DlqStatus::Quarantined.is_terminal());
        assert!(!DlqStatus::Reprocessing.is_terminal());
        assert!(DlqStatus::Resolved.is_terminal());
        assert!(DlqStatus::Discarded.is_terminal());
    }
}
