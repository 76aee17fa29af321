//! Integration events this service produces: the `ReserveInventory` step's
//! success/failure replies, `ReleaseCompleted` closing out a compensation,
//! and the raw `inventory_reservation::InventoryEvent`s each product
//! mutation emits, wrapped for the bus.

use chrono::Utc;
use event_envelope::{EventEnvelope, IntegrationEvent};
use inventory_reservation::InventoryEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use transactional_outbox::OutboxMessage;
use uuid::Uuid;

/// The `ReserveInventory` step's success reply, per
/// `OrderCreationStep::success_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReservationConfirmed {
    pub order_id: Uuid,
}

impl IntegrationEvent for InventoryReservationConfirmed {
    const EVENT_TYPE: &'static str = "InventoryReservationConfirmed";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "inventory-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// The `ReserveInventory` step's failure reply, per
/// `OrderCreationStep::failure_event`. Emitted when any line item could not
/// be reserved; any items already reserved for this order are rolled back
/// before this is produced, so the saga never needs to compensate a partial
/// reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReservationFailed {
    pub order_id: Uuid,
    pub reason: String,
}

impl IntegrationEvent for InventoryReservationFailed {
    const EVENT_TYPE: &'static str = "InventoryReservationFailed";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "inventory-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// Reply to `ReleaseReservation`, the `ReserveInventory` step's
/// compensation command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseCompleted {
    pub order_id: Uuid,
}

impl IntegrationEvent for ReleaseCompleted {
    const EVENT_TYPE: &'static str = "ReleaseCompleted";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "inventory-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

fn stock_event_type(event: &InventoryEvent) -> &'static str {
    match event {
        InventoryEvent::StockReserved { .. } => "StockReserved",
        InventoryEvent::LowStockDetected { .. } => "LowStockDetected",
        InventoryEvent::StockDeducted { .. } => "StockDeducted",
        InventoryEvent::StockReleased { .. } => "StockReleased",
        InventoryEvent::ReservationExpired { .. } => "ReservationExpired",
        InventoryEvent::StockAdjusted { .. } => "StockAdjusted",
    }
}

fn stock_event_aggregate_id(event: &InventoryEvent) -> Uuid {
    match event {
        InventoryEvent::StockReserved { product_id, .. }
        | InventoryEvent::LowStockDetected { product_id, .. }
        | InventoryEvent::StockDeducted { product_id, .. }
        | InventoryEvent::StockReleased { product_id, .. }
        | InventoryEvent::ReservationExpired { product_id, .. }
        | InventoryEvent::StockAdjusted { product_id, .. } => *product_id,
    }
}

/// Wrap a batch of `InventoryEvent`s (as produced by `Product::reserve`,
/// `confirm`, `release`, `expire_due`, `adjust`) into outbox rows, keyed by
/// the product aggregate rather than the order. These are facts about stock
/// levels, consumed by Analytics and any future replenishment workflow --
/// not the saga's own reply events, which are built separately by the
/// handlers that call these mutations.
pub fn stock_events_to_outbox(events: Vec<InventoryEvent>, correlation_id: &str) -> anyhow::Result<Vec<OutboxMessage>> {
    events
        .into_iter()
        .map(|event| {
            let aggregate_id = stock_event_aggregate_id(&event);
            let event_type = stock_event_type(&event);
            let envelope = EventEnvelope {
                event_id: Uuid::new_v4(),
                aggregate_id,
                event_type: event_type.to_string(),
                schema_version: "1.0".to_string(),
                producer: "inventory-service".to_string(),
                occurred_on: Utc::now(),
                correlation_id: correlation_id.to_string(),
                causation_id: None,
                traceparent: None,
                tenant_id: None,
                headers: HashMap::new(),
                payload: event,
            };
            Ok(OutboxMessage {
                id: envelope.event_id,
                aggregate_id,
                event_type: event_type.to_string(),
                payload: serde_json::to_value(&envelope)?,
                occurred_at: envelope.occurred_on,
                correlation_id: correlation_id.to_string(),
                processed_at: None,
                retry_count: 0,
                last_error: None,
            })
        })
        .collect()
}
