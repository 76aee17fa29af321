//! The `Order` aggregate and the integration events this service produces.
//!
//! Wire event type strings are the same strings `saga_orchestrator`'s
//! `OrderCreationStep` already uses for `forward_command`/`compensation_command`
//! (`InventoryReservationRequested`, `PaymentRequested`, `ReleaseReservation`,
//! `RefundPayment`) so the saga's pure state machine and the events actually
//! published onto the bus never drift apart.

use chrono::{DateTime, Utc};
use event_envelope::IntegrationEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Confirmed => "Confirmed",
            OrderStatus::Cancelled => "Cancelled",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "Confirmed" => OrderStatus::Confirmed,
            "Cancelled" => OrderStatus::Cancelled,
            _ => OrderStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub items: Vec<OrderLineItem>,
    pub total_cents: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(items: Vec<OrderLineItem>) -> Self {
        let total_cents = items.iter().map(|i| i.unit_price_cents * i.quantity as i64).sum();
        Self {
            id: Uuid::new_v4(),
            items,
            total_cents,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Fact: a new order was created. Consumed by Notification and Analytics;
/// carries the line items Inventory would need, but reservation itself is
/// driven by `InventoryReservationRequested` below so the wire event name
/// matches the saga's own command vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub items: Vec<OrderLineItem>,
    pub total_cents: i64,
}

impl IntegrationEvent for OrderCreated {
    const EVENT_TYPE: &'static str = "OrderCreated";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// The `ReserveInventory` step's forward command, per
/// `OrderCreationStep::forward_command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReservationRequested {
    pub order_id: Uuid,
    pub items: Vec<OrderLineItem>,
}

impl IntegrationEvent for InventoryReservationRequested {
    const EVENT_TYPE: &'static str = "InventoryReservationRequested";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// The `ProcessPayment` step's forward command. No payment service ships in
/// this workspace; an external one is expected to consume this and reply
/// with `PaymentConfirmed`/`PaymentFailed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequested {
    pub order_id: Uuid,
    pub amount_cents: i64,
}

impl IntegrationEvent for PaymentRequested {
    const EVENT_TYPE: &'static str = "PaymentRequested";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// `ConfirmOrder`'s forward action executes locally (no external step to
/// wait for); this is the success fact it produces, consumed by Shipping,
/// Notification, and Analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    pub order_id: Uuid,
}

impl IntegrationEvent for OrderConfirmed {
    const EVENT_TYPE: &'static str = "OrderConfirmed";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// Supplemental to the saga's own command vocabulary: `ConfirmOrder`
/// succeeding locally still needs to tell Inventory to turn the `Active`
/// reservation into a stock deduction (`Product::confirm`). Fire-and-forget
/// -- the saga completes on its own local transition and does not wait for
/// Inventory's response, matching the happy-path scenario where Inventory
/// ends with stock deducted rather than merely reserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmReservation {
    pub order_id: Uuid,
    pub items: Vec<OrderLineItem>,
}

impl IntegrationEvent for ConfirmReservation {
    const EVENT_TYPE: &'static str = "ConfirmReservation";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// The `ReserveInventory` step's compensation command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReservation {
    pub order_id: Uuid,
    pub items: Vec<OrderLineItem>,
}

impl IntegrationEvent for ReleaseReservation {
    const EVENT_TYPE: &'static str = "ReleaseReservation";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// The `ProcessPayment` step's compensation command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundPayment {
    pub order_id: Uuid,
    pub amount_cents: i64,
}

impl IntegrationEvent for RefundPayment {
    const EVENT_TYPE: &'static str = "RefundPayment";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// Fact emitted once the saga fully compensates. Consumed by Inventory (as
/// a backstop, in case `ReleaseReservation` itself was lost), Payment, and
/// Notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: Uuid,
    pub reason: String,
}

impl IntegrationEvent for OrderCancelled {
    const EVENT_TYPE: &'static str = "OrderCancelled";
    const SCHEMA_VERSION: &'static str = "1.0";
    const PRODUCER: &'static str = "order-service";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}
