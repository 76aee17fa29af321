//! Inbox-driven handlers that advance the `OrderCreation` saga in response to
//! inbound events, plus the local `ConfirmOrder` completion path that runs
//! synchronously once `PaymentConfirmed` lands — there is no external
//! service to wait on for that step, so its forward action (mark the order
//! confirmed, tell Inventory to deduct stock) happens inline instead of via
//! a wire command.

use std::sync::Arc;

use event_bus::IncomingMessage;
use event_envelope::EventEnvelope;
use inbox::{ConsumeOutcome, InboxRepository};
use saga_orchestrator::{SagaAction, SagaInstance, SagaRepository};
use sqlx::{PgPool, Postgres, Transaction};
use transactional_outbox::{OutboxMessage, OutboxRepository};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{ConfirmReservation, OrderConfirmed, OrderStatus, PaymentRequested, ReleaseReservation};
use crate::repository::OrderRepository;

const CONSUMER: &str = "order-service";

pub struct HandlerContext<S, O, IB, R> {
    pub pool: PgPool,
    pub saga_repo: Arc<S>,
    pub outbox_repo: Arc<O>,
    pub inbox_repo: Arc<IB>,
    pub order_repo: Arc<R>,
}

impl<S, O, IB, R> Clone for HandlerContext<S, O, IB, R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            saga_repo: self.saga_repo.clone(),
            outbox_repo: self.outbox_repo.clone(),
            inbox_repo: self.inbox_repo.clone(),
            order_repo: self.order_repo.clone(),
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

fn to_outbox_message<T: serde::Serialize>(
    aggregate_id: Uuid,
    correlation_id: &str,
    event_type: &str,
    envelope: &EventEnvelope<T>,
) -> anyhow::Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: envelope.event_id,
        aggregate_id,
        event_type: event_type.to_string(),
        payload: serde_json::to_value(envelope)?,
        occurred_at: envelope.occurred_on,
        correlation_id: correlation_id.to_string(),
        processed_at: None,
        retry_count: 0,
        last_error: None,
    })
}

/// Fetch the saga by correlation id under a row lock held for the rest of
/// `tx`, apply `advance`, and persist the result in the same transaction.
/// The lock excludes a concurrent event or timeout-scan tick for this saga
/// rather than racing its `version` guard, so there's no conflict to retry.
async fn advance_saga<S: SagaRepository>(
    saga_repo: &S,
    tx: &mut Transaction<'_, Postgres>,
    correlation_id: &str,
    event_type: &str,
    referenced_step: &str,
) -> anyhow::Result<(SagaInstance, SagaAction)> {
    let mut saga = saga_repo
        .get_by_correlation_id_for_update(tx, correlation_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no saga found for correlation id {correlation_id}"))?;

    let action = saga_orchestrator::advance(&mut saga, event_type, referenced_step);
    if action != SagaAction::Ignored {
        saga_repo.update_in_tx(tx, &saga).await?;
    }
    Ok((saga, action))
}

/// `InventoryReservationConfirmed`: advance to `ProcessPayment` and emit
/// `PaymentRequested`.
pub async fn handle_inventory_reservation_confirmed<S, O, IB, R>(
    ctx: HandlerContext<S, O, IB, R>,
    msg: IncomingMessage,
) -> anyhow::Result<()>
where
    S: SagaRepository,
    O: OutboxRepository,
    IB: InboxRepository,
    R: OrderRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let saga_repo = ctx.saga_repo.clone();
        let outbox_repo = ctx.outbox_repo.clone();
        let order_repo = ctx.order_repo.clone();
        async move {
            let (_saga, action) =
                advance_saga(&*saga_repo, tx, &correlation_id, "InventoryReservationConfirmed", "ReserveInventory")
                    .await?;

            if let SagaAction::EmitForward { command: "PaymentRequested" } = action {
                let order = order_repo
                    .get(order_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("order {order_id} not found"))?;

                let envelope = EventEnvelope::caused_by(
                    PaymentRequested {
                        order_id,
                        amount_cents: order.total_cents,
                    },
                    correlation_id.clone(),
                    event_id,
                    None,
                );
                let message = to_outbox_message(order_id, &correlation_id, "PaymentRequested", &envelope)?;
                outbox_repo.insert(tx, &message).await?;
            }
            Ok(())
        }
    })
    .await?;

    log_outcome("InventoryReservationConfirmed", order_id, outcome);
    Ok(())
}

/// `InventoryReservationFailed`: the first step has nothing to compensate,
/// so this drives the saga straight to `Compensated`.
pub async fn handle_inventory_reservation_failed<S, O, IB, R>(
    ctx: HandlerContext<S, O, IB, R>,
    msg: IncomingMessage,
) -> anyhow::Result<()>
where
    S: SagaRepository,
    O: OutboxRepository,
    IB: InboxRepository,
    R: OrderRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let saga_repo = ctx.saga_repo.clone();
        let order_repo = ctx.order_repo.clone();
        async move {
            let (_saga, action) =
                advance_saga(&*saga_repo, tx, &correlation_id, "InventoryReservationFailed", "ReserveInventory")
                    .await?;

            if action == SagaAction::Compensated {
                order_repo.update_status_in_tx(tx, order_id, OrderStatus::Cancelled).await?;
            }
            Ok(())
        }
    })
    .await?;

    log_outcome("InventoryReservationFailed", order_id, outcome);
    Ok(())
}

/// `PaymentFailed`: `ProcessPayment`'s own forward action never completed,
/// so there's nothing of its own to refund. Compensation starts directly at
/// the last step that actually succeeded, `ReserveInventory`, by emitting
/// its compensating command `ReleaseReservation`.
pub async fn handle_payment_failed<S, O, IB, R>(
    ctx: HandlerContext<S, O, IB, R>,
    msg: IncomingMessage,
) -> anyhow::Result<()>
where
    S: SagaRepository,
    O: OutboxRepository,
    IB: InboxRepository,
    R: OrderRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let saga_repo = ctx.saga_repo.clone();
        let outbox_repo = ctx.outbox_repo.clone();
        let order_repo = ctx.order_repo.clone();
        async move {
            let (_saga, action) =
                advance_saga(&*saga_repo, tx, &correlation_id, "PaymentFailed", "ProcessPayment").await?;

            if let SagaAction::EmitCompensation { command: "ReleaseReservation" } = action {
                let order = order_repo
                    .get(order_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("order {order_id} not found"))?;
                let envelope = EventEnvelope::caused_by(
                    ReleaseReservation { order_id, items: order.items },
                    correlation_id.clone(),
                    event_id,
                    None,
                );
                let message = to_outbox_message(order_id, &correlation_id, "ReleaseReservation", &envelope)?;
                outbox_repo.insert(tx, &message).await?;
            }
            Ok(())
        }
    })
    .await?;

    log_outcome("PaymentFailed", order_id, outcome);
    Ok(())
}

/// `ReleaseCompleted`: the compensation chain is exhausted. Mark the order
/// cancelled.
pub async fn handle_release_completed<S, O, IB, R>(
    ctx: HandlerContext<S, O, IB, R>,
    msg: IncomingMessage,
) -> anyhow::Result<()>
where
    S: SagaRepository,
    O: OutboxRepository,
    IB: InboxRepository,
    R: OrderRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let saga_repo = ctx.saga_repo.clone();
        let order_repo = ctx.order_repo.clone();
        async move {
            let (_saga, action) =
                advance_saga(&*saga_repo, tx, &correlation_id, "ReleaseCompleted", "ReserveInventory").await?;

            if action == SagaAction::Compensated {
                order_repo.update_status_in_tx(tx, order_id, OrderStatus::Cancelled).await?;
            }
            Ok(())
        }
    })
    .await?;

    log_outcome("ReleaseCompleted", order_id, outcome);
    Ok(())
}

/// `PaymentConfirmed`: advance `ProcessPayment` to its local `ConfirmOrder`
/// step, then immediately run that step's forward action inline (mark the
/// order confirmed, emit `OrderConfirmed` + `ConfirmReservation`) and drive
/// the saga the rest of the way to `Completed` in the same inbox
/// transaction.
pub async fn handle_payment_confirmed<S, O, IB, R>(
    ctx: HandlerContext<S, O, IB, R>,
    msg: IncomingMessage,
) -> anyhow::Result<()>
where
    S: SagaRepository,
    O: OutboxRepository,
    IB: InboxRepository,
    R: OrderRepository,
{
    let event_id = extract_event_id(&msg);
    let order_id = extract_order_id(&msg)?;
    let correlation_id = order_id.to_string();

    let outcome = inbox::consume(&*ctx.inbox_repo, &ctx.pool, event_id, CONSUMER, |tx| {
        let saga_repo = ctx.saga_repo.clone();
        let outbox_repo = ctx.outbox_repo.clone();
        let order_repo = ctx.order_repo.clone();
        async move {
            let (_saga, action) =
                advance_saga(&*saga_repo, tx, &correlation_id, "PaymentConfirmed", "ProcessPayment").await?;

            if action != (SagaAction::EmitForward { command: "ConfirmOrder" }) {
                warn!(order_id = %order_id, action = ?action, "PaymentConfirmed did not yield ConfirmOrder, saga state drifted");
                return Ok(());
            }

            order_repo.update_status_in_tx(tx, order_id, OrderStatus::Confirmed).await?;

            let order = order_repo
                .get(order_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("order {order_id} not found"))?;

            let confirmed = EventEnvelope::caused_by(
                OrderConfirmed { order_id },
                correlation_id.clone(),
                event_id,
                None,
            );
            let confirmed_msg = to_outbox_message(order_id, &correlation_id, "OrderConfirmed", &confirmed)?;
            outbox_repo.insert(tx, &confirmed_msg).await?;

            let confirm_reservation = EventEnvelope::caused_by(
                ConfirmReservation { order_id, items: order.items },
                correlation_id.clone(),
                confirmed.event_id,
                None,
            );
            let reservation_msg =
                to_outbox_message(order_id, &correlation_id, "ConfirmReservation", &confirm_reservation)?;
            outbox_repo.insert(tx, &reservation_msg).await?;

            let (_saga, final_action) =
                advance_saga(&*saga_repo, tx, &correlation_id, "OrderConfirmed", "ConfirmOrder").await?;
            if final_action != SagaAction::Complete {
                warn!(order_id = %order_id, action = ?final_action, "local ConfirmOrder completion did not complete the saga");
            }

            Ok(())
        }
    })
    .await?;

    log_outcome("PaymentConfirmed", order_id, outcome);
    Ok(())
}

fn log_outcome(event_type: &str, order_id: Uuid, outcome: ConsumeOutcome) {
    match outcome {
        ConsumeOutcome::Processed => info!(event_type, %order_id, "saga event processed"),
        ConsumeOutcome::Duplicate => info!(event_type, %order_id, "duplicate saga event absorbed"),
        ConsumeOutcome::Failed { retry_count, poisoned } => {
            warn!(event_type, %order_id, retry_count, poisoned, "saga event handler failed")
        }
    }
}
