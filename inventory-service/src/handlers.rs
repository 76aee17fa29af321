//! Inbox-driven handlers for the three commands this service answers:
//! `InventoryReservationRequested` (the `ReserveInventory` step's forward
//! command), `ReleaseReservation` (its compensation), and `ConfirmReservation`
//! (the fire-and-forget deduction triggered by `ConfirmOrder` completing
//! locally in order-service).

use std::sync::Arc;

use event_bus::IncomingMessage;
use event_envelope::EventEnvelope;
use inbox::{ConsumeOutcome, InboxRepository};
use inventory_reservation::{InventoryError, ProductRepository, ReservationStatus};
use serde::Deserialize;
use sqlx::PgPool;
use transactional_outbox::OutboxRepository;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{stock_events_to_outbox, InventoryReservationConfirmed, InventoryReservationFailed, ReleaseCompleted};

const CONSUMER: &str = "inventory-service";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineItem {
    product_id: Uuid,
    quantity: i32,
}

pub struct HandlerContext<P, O, IB> {
    pub pool: PgPool,
    pub product_repo: Arc<P>,
    pub outbox_repo: Arc<O>,
    pub inbox_repo: Arc<IB>,
}

impl<P, O, IB> Clone for HandlerContext<P, O, IB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            product_repo: self.product_repo.clone(),
            outbox_repo: self.outbox_repo.clone(),
            inbox_repo: self.inbox_repo.clone(),
        }
    }
}

fn extract_event_id(msg: &IncomingMessage) -> Uuid {
    msg.event_id
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn extract_order_id(msg: &IncomingMessage) -> anyhow::Result<Uuid> {
    msg.payload
        .get("payload")
        .and_then(|p| p.get("orderId"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("missing payload.orderId in {} message", msg.event_type))
}

fn extract_items(msg: &IncomingMessage) -> anyhow::Result<Vec<LineItem>> {
    let items = msg
        .payload
        .get("payload")
        .and_then(|p| p.get("items"))
        .ok_or_else(|| anyhow::anyhow!("missing payload.items in {} message", msg.event_type))?;
    Ok(serde_json::from_value(items.clone())?)
}

/// True if `order_id` already holds a reservation for `product_id` that
/// isn't `Released`/`Expired` -- a retry of a handler that already reserved
/// this item on a previous (failed mid-batch) attempt sees this as `true`
/// and skips re-reserving, since `Product::reserve` has no notion of
/// `order_id` idempotency on its own.
async fn already_active_or_confirmed<R: ProductRepository>(repo: &R, product_id: Uuid, order_id: Uuid) -> anyhow::Result<bool> {
    let product = repo.get(product_id).await?;
    Ok(product
        .reservations
        .iter()
        .any(|r| r.order_id == order_id && matches!(r.status, ReservationStatus::Active | ReservationStatus::Confirmed)))
}

/// `InventoryReservationRequested`: reserve every line item. On the first
/// item that cannot be reserved, release everything already reserved for
/// this order in this attempt and reply with `InventoryReservationFailed`
/// instead of propagating an error, since running out of stock is an
/// expected business outcome, not a transient fault to retry.
pub async fn handle_inventory_reservation_requested<P, O, IB>(
    ctx: HandlerContext<P, O, IB>,
    msg: IncomingMessage,
) -> anyhow::Result<()>
where
    P: ProductRepository,
    O: OutboxRepository,
    IB: InboxRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let items = extract_items(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let product_repo = ctx.product_repo.clone();
        let outbox_repo = ctx.outbox_repo.clone();
        let correlation_id = correlation_id.clone();
        async move {
            let mut reserved_product_ids = Vec::new();
            let mut failure_reason = None;

            for item in &items {
                if already_active_or_confirmed(&*product_repo, item.product_id, order_id).await? {
                    reserved_product_ids.push(item.product_id);
                    continue;
                }

                match inventory_reservation::reserve_in_tx(
                    &*product_repo,
                    tx,
                    item.product_id,
                    order_id,
                    item.quantity,
                    inventory_reservation::DEFAULT_RESERVATION_TTL,
                )
                .await
                {
                    Ok(events) => {
                        reserved_product_ids.push(item.product_id);
                        let rows = stock_events_to_outbox(events, &correlation_id)?;
                        for row in rows {
                            outbox_repo.insert(tx, &row).await?;
                        }
                    }
                    Err(InventoryError::InsufficientStock { available, requested, .. }) => {
                        failure_reason = Some(format!(
                            "insufficient stock for product {}: have {available}, need {requested}",
                            item.product_id
                        ));
                        break;
                    }
                    Err(InventoryError::InvalidQuantity) => {
                        failure_reason = Some(format!("invalid quantity requested for product {}", item.product_id));
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some(reason) = failure_reason {
                for product_id in &reserved_product_ids {
                    if let Err(e) = inventory_reservation::release_in_tx(&*product_repo, tx, *product_id, order_id).await {
                        warn!(product_id = %product_id, order_id = %order_id, error = ?e, "failed to roll back reservation after a sibling item failed");
                    }
                }

                let envelope = EventEnvelope::caused_by(
                    InventoryReservationFailed { order_id, reason },
                    correlation_id.clone(),
                    event_id,
                    None,
                );
                outbox_repo
                    .insert(
                        tx,
                        &transactional_outbox::OutboxMessage {
                            id: envelope.event_id,
                            aggregate_id: order_id,
                            event_type: "InventoryReservationFailed".to_string(),
                            payload: serde_json::to_value(&envelope)?,
                            occurred_at: envelope.occurred_on,
                            correlation_id,
                            processed_at: None,
                            retry_count: 0,
                            last_error: None,
                        },
                    )
                    .await?;
            } else {
                let envelope = EventEnvelope::caused_by(
                    InventoryReservationConfirmed { order_id },
                    correlation_id.clone(),
                    event_id,
                    None,
                );
                outbox_repo
                    .insert(
                        tx,
                        &transactional_outbox::OutboxMessage {
                            id: envelope.event_id,
                            aggregate_id: order_id,
                            event_type: "InventoryReservationConfirmed".to_string(),
                            payload: serde_json::to_value(&envelope)?,
                            occurred_at: envelope.occurred_on,
                            correlation_id,
                            processed_at: None,
                            retry_count: 0,
                            last_error: None,
                        },
                    )
                    .await?;
            }

            Ok(())
        }
    })
    .await?;

    log_outcome("InventoryReservationRequested", order_id, outcome);
    Ok(())
}

/// `ReleaseReservation`: release every line item's active reservation, if
/// any, then always reply with `ReleaseCompleted` -- the saga is already
/// compensating and must not get stuck waiting on a reply that never comes
/// because a reservation had already expired on its own.
pub async fn handle_release_reservation<P, O, IB>(ctx: HandlerContext<P, O, IB>, msg: IncomingMessage) -> anyhow::Result<()>
where
    P: ProductRepository,
    O: OutboxRepository,
    IB: InboxRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let items = extract_items(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let product_repo = ctx.product_repo.clone();
        let outbox_repo = ctx.outbox_repo.clone();
        let correlation_id = correlation_id.clone();
        async move {
            for item in &items {
                match inventory_reservation::release_in_tx(&*product_repo, tx, item.product_id, order_id).await {
                    Ok(events) => {
                        let rows = stock_events_to_outbox(events, &correlation_id)?;
                        for row in rows {
                            outbox_repo.insert(tx, &row).await?;
                        }
                    }
                    Err(InventoryError::ReservationNotFound(_)) => {
                        info!(product_id = %item.product_id, order_id = %order_id, "no active reservation to release, treating as already compensated");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let envelope = EventEnvelope::caused_by(ReleaseCompleted { order_id }, correlation_id.clone(), event_id, None);
            outbox_repo
                .insert(
                    tx,
                    &transactional_outbox::OutboxMessage {
                        id: envelope.event_id,
                        aggregate_id: order_id,
                        event_type: "ReleaseCompleted".to_string(),
                        payload: serde_json::to_value(&envelope)?,
                        occurred_at: envelope.occurred_on,
                        correlation_id,
                        processed_at: None,
                        retry_count: 0,
                        last_error: None,
                    },
                )
                .await?;

            Ok(())
        }
    })
    .await?;

    log_outcome("ReleaseReservation", order_id, outcome);
    Ok(())
}

/// `ConfirmReservation`: deduct stock for every line item. Fire-and-forget
/// -- order-service's saga has already completed locally by the time this
/// runs, so there is no reply to emit, only the `StockDeducted` facts that
/// `inventory_reservation::confirm` itself produces.
pub async fn handle_confirm_reservation<P, O, IB>(ctx: HandlerContext<P, O, IB>, msg: IncomingMessage) -> anyhow::Result<()>
where
    P: ProductRepository,
    O: OutboxRepository,
    IB: InboxRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let items = extract_items(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let product_repo = ctx.product_repo.clone();
        let outbox_repo = ctx.outbox_repo.clone();
        let correlation_id = correlation_id.clone();
        async move {
            for item in &items {
                match inventory_reservation::confirm_in_tx(&*product_repo, tx, item.product_id, order_id).await {
                    Ok(events) => {
                        let rows = stock_events_to_outbox(events, &correlation_id)?;
                        for row in rows {
                            outbox_repo.insert(tx, &row).await?;
                        }
                    }
                    Err(InventoryError::ReservationNotFound(_)) => {
                        info!(product_id = %item.product_id, order_id = %order_id, "no active reservation to confirm, treating as already deducted");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        }
    })
    .await?;

    log_outcome("ConfirmReservation", order_id, outcome);
    Ok(())
}

fn log_outcome(event_type: &str, order_id: Uuid, outcome: ConsumeOutcome) {
    match outcome {
        ConsumeOutcome::Processed => info!(event_type, %order_id, "reservation event processed"),
        ConsumeOutcome::Duplicate => info!(event_type, %order_id, "duplicate reservation event absorbed"),
        ConsumeOutcome::Failed { retry_count, poisoned } => {
            warn!(event_type, %order_id, retry_count, poisoned, "reservation event handler failed")
        }
    }
}
