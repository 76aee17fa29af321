//! Order persistence, including the one entry point (`create_order_with_saga`)
//! that must commit the order row, its `OrderCreation` saga instance, and the
//! outbox rows for `OrderCreated`/`InventoryReservationRequested` atomically.
//!
//! `saga_orchestrator::SqlxSagaRepository` is not used here on purpose: its
//! `create` runs in its own pool-acquired statement, and this path needs the
//! insert inside the same transaction as the order row and the outbox rows.
//! The INSERT below mirrors `SqlxSagaRepository::create`'s column list and
//! defaults exactly, so reads through `SagaRepository::get` see an identical
//! row either way.

use async_trait::async_trait;
use event_envelope::{EventEnvelope, IntegrationEvent};
use saga_orchestrator::{OrderCreationStep, SagaInstance, SagaState};
use serde_json::json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use transactional_outbox::{OutboxMessage, OutboxRepository};
use uuid::Uuid;

use crate::domain::{InventoryReservationRequested, Order, OrderCreated, OrderLineItem, OrderStatus};
use crate::error::AppError;

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Order>, AppError>;
    /// Guarded status update scoped to a caller-owned transaction so it
    /// commits atomically with the outbox rows and inbox mark the caller
    /// writes alongside it.
    async fn update_status_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        status: OrderStatus,
    ) -> Result<(), AppError>;
}

pub struct SqlxOrderRepository {
    pool: PgPool,
}

impl SqlxOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for SqlxOrderRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Order>, AppError> {
        let row = sqlx::query(
            "SELECT id, items, total_cents, status, created_at FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let items: serde_json::Value = r.try_get("items")?;
            Ok(Order {
                id: r.try_get("id")?,
                items: serde_json::from_value(items).unwrap_or_default(),
                total_cents: r.try_get("total_cents")?,
                status: OrderStatus::from_db_str(r.try_get::<String, _>("status")?.as_str()),
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
        .map_err(AppError::Database)
    }

    async fn update_status_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        status: OrderStatus,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE orders SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_db_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Insert the saga-instance row mirroring `SqlxSagaRepository::create`,
/// scoped to the caller's transaction.
async fn insert_saga(tx: &mut Transaction<'_, Postgres>, saga: &SagaInstance) -> Result<(), AppError> {
    let step_history = serde_json::to_value(&saga.step_history).map_err(|e| AppError::Other(e.into()))?;
    sqlx::query(
        r#"
        INSERT INTO saga_instances (
            id, saga_type, correlation_id, state, current_step, step_history, data, timeout_at, version
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(saga.id)
    .bind(&saga.saga_type)
    .bind(&saga.correlation_id)
    .bind(match saga.state {
        SagaState::Running => "Running",
        SagaState::Completed => "Completed",
        SagaState::Compensating => "Compensating",
        SagaState::Compensated => "Compensated",
        SagaState::Failed => "Failed",
    })
    .bind(&saga.current_step)
    .bind(&step_history)
    .bind(&saga.data)
    .bind(saga.timeout_at)
    .bind(saga.version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Atomically persist a new order, its `OrderCreation` saga instance, and the
/// `OrderCreated` + `InventoryReservationRequested` outbox rows. Either all of
/// this commits or none of it does.
pub async fn create_order_with_saga<O: OutboxRepository>(
    pool: &PgPool,
    outbox: &O,
    items: Vec<OrderLineItem>,
) -> Result<(Order, SagaInstance), AppError> {
    let order = Order::new(items);
    let correlation_id = order.id.to_string();

    let saga = SagaInstance::new_order_creation(
        correlation_id.clone(),
        json!({ "orderId": order.id, "items": order.items, "totalCents": order.total_cents }),
    );

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO orders (id, items, total_cents, status, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(order.id)
    .bind(serde_json::to_value(&order.items).map_err(|e| AppError::Other(e.into()))?)
    .bind(order.total_cents)
    .bind(order.status.as_db_str())
    .bind(order.created_at)
    .execute(&mut *tx)
    .await?;

    insert_saga(&mut tx, &saga).await?;

    let created = EventEnvelope::new(
        OrderCreated {
            order_id: order.id,
            items: order.items.clone(),
            total_cents: order.total_cents,
        },
        correlation_id.clone(),
    );
    outbox
        .insert(
            &mut tx,
            &OutboxMessage {
                id: created.event_id,
                aggregate_id: order.id,
                event_type: OrderCreated::EVENT_TYPE.to_string(),
                payload: serde_json::to_value(&created).map_err(|e| AppError::Other(e.into()))?,
                occurred_at: created.occurred_on,
                correlation_id: correlation_id.clone(),
                processed_at: None,
                retry_count: 0,
                last_error: None,
            },
        )
        .await?;

    let reservation_requested = EventEnvelope::caused_by(
        InventoryReservationRequested {
            order_id: order.id,
            items: order.items.clone(),
        },
        correlation_id.clone(),
        created.event_id,
        None,
    );
    outbox
        .insert(
            &mut tx,
            &OutboxMessage {
                id: reservation_requested.event_id,
                aggregate_id: order.id,
                event_type: OrderCreationStep::ReserveInventory.forward_command().to_string(),
                payload: serde_json::to_value(&reservation_requested).map_err(|e| AppError::Other(e.into()))?,
                occurred_at: reservation_requested.occurred_on,
                correlation_id,
                processed_at: None,
                retry_count: 0,
                last_error: None,
            },
        )
        .await?;

    tx.commit().await?;

    Ok((order, saga))
}
