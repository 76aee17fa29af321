//! Convenience macros for inserting an outbox row alongside an aggregate
//! mutation within the same transaction.

/// Build and insert an [`crate::OutboxMessage`] from an `EventEnvelope`.
///
/// # Usage
///
/// ```rust,no_run
/// use transactional_outbox::{publish_envelope, SqlxOutboxRepository};
/// use event_envelope::{EventEnvelope, IntegrationEvent};
/// use sqlx::PgPool;
/// use uuid::Uuid;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated { order_id: Uuid }
/// impl IntegrationEvent for OrderCreated {
///     const EVENT_TYPE: &'static str = "OrderCreated";
///     const SCHEMA_VERSION: &'static str = "1.0";
///     const PRODUCER: &'static str = "order-service";
///     fn aggregate_id(&self) -> Uuid { self.order_id }
/// }
///
/// # async fn example(pool: PgPool, repo: SqlxOutboxRepository) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
/// let order_id = Uuid::new_v4();
///
/// sqlx::query!("INSERT INTO orders (id) VALUES ($1)", order_id)
///     .execute(&mut *tx)
///     .await?;
///
/// let envelope = EventEnvelope::new(OrderCreated { order_id }, "corr-1");
/// publish_envelope!(&mut tx, &repo, &envelope)?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! publish_envelope {
    ($tx:expr, $repo:expr, $envelope:expr) => {{
        use $crate::{OutboxMessage, OutboxRepository};

        match serde_json::to_value(&$envelope).map_err($crate::OutboxError::from) {
            Ok(payload) => {
                let message = OutboxMessage {
                    id: $envelope.event_id,
                    aggregate_id: $envelope.aggregate_id,
                    event_type: $envelope.event_type.clone(),
                    payload,
                    occurred_at: $envelope.occurred_on,
                    correlation_id: $envelope.correlation_id.clone(),
                    processed_at: None,
                    retry_count: 0,
                    last_error: None,
                };
                $repo.insert($tx, &message).await
            }
            Err(e) => Err(e),
        }
    }};
}

#[cfg(test)]
mod tests {
    // Macro correctness is a compile-time property, exercised by the
    // `publish_envelope!` doctest above.
}
