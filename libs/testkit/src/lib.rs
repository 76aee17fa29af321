//! In-memory fakes for the repository and publisher traits that don't bind
//! to a live `sqlx::Transaction`, so the orchestration logic in
//! `saga-orchestrator`, `inventory-reservation`, `dead-letter-queue` and the
//! bus publishers can be exercised in a plain `#[tokio::test]` without a
//! database. `transactional-outbox::OutboxRepository` and
//! `inbox::InboxRepository` take a `&mut Transaction<'_, Postgres>` on every
//! method and aren't faked here — those stay on the `#[ignore]`-gated
//! real-Postgres integration tests each of those crates already ships.

use async_trait::async_trait;
use dead_letter_queue::{DeadLetterMessage, DlqError, DlqFilter, DlqRepository, DlqResult, DlqStatus};
use inventory_reservation::{InventoryError, InventoryResult, Product, ProductRepository};
use saga_orchestrator::{SagaError, SagaInstance, SagaRepository, SagaResult};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Backs [`saga_orchestrator::SagaRepository`] with a `HashMap` guarded by a
/// `std::sync::Mutex`; good enough for single-threaded test driving of the
/// saga state machine, including its optimistic-concurrency contract.
#[derive(Default)]
pub struct InMemorySagaRepository {
    sagas: Mutex<HashMap<Uuid, SagaInstance>>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn create(&self, saga: &SagaInstance) -> SagaResult<()> {
        self.sagas.lock().unwrap().insert(saga.id, saga.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SagaResult<SagaInstance> {
        self.sagas
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(SagaError::NotFound(id))
    }

    async fn get_by_correlation_id(&self, correlation_id: &str) -> SagaResult<Option<SagaInstance>> {
        Ok(self
            .sagas
            .lock()
            .unwrap()
            .values()
            .find(|s| s.correlation_id == correlation_id)
            .cloned())
    }

    async fn update(&self, saga: &SagaInstance) -> SagaResult<()> {
        let mut sagas = self.sagas.lock().unwrap();
        let stored = sagas.get(&saga.id).ok_or(SagaError::NotFound(saga.id))?;
        if stored.version != saga.version {
            return Err(SagaError::VersionConflict(saga.id));
        }
        let mut next = saga.clone();
        next.version += 1;
        sagas.insert(saga.id, next);
        Ok(())
    }

    /// See the doc comment on `get_for_update` below -- `tx` is accepted
    /// and ignored, the read is identical to `get_by_correlation_id`.
    async fn get_by_correlation_id_for_update(
        &self,
        _tx: &mut Transaction<'_, Postgres>,
        correlation_id: &str,
    ) -> SagaResult<Option<SagaInstance>> {
        self.get_by_correlation_id(correlation_id).await
    }

    /// The in-memory store has no transaction of its own to join, so `tx`
    /// is accepted for signature parity with `SqlxSagaRepository` and
    /// otherwise ignored; the guarded update is identical to `update`.
    async fn update_in_tx(&self, _tx: &mut Transaction<'_, Postgres>, saga: &SagaInstance) -> SagaResult<()> {
        self.update(saga).await
    }

    async fn list_timed_out(&self, now: chrono::DateTime<chrono::Utc>) -> SagaResult<Vec<SagaInstance>> {
        Ok(self
            .sagas
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.timeout_at <= now)
            .cloned()
            .collect())
    }
}

/// Backs [`inventory_reservation::ProductRepository`]. `save` compares
/// `row_version` the same way the `sqlx` implementation does, so tests can
/// exercise the bounded-retry path in `mutate_with_retry` by racing two
/// reads against one save.
#[derive(Default)]
pub struct InMemoryProductRepository {
    products: Mutex<HashMap<Uuid, Product>>,
}

impl InMemoryProductRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, product: Product) {
        self.products.lock().unwrap().insert(product.id, product);
    }
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository {
    async fn get(&self, id: Uuid) -> InventoryResult<Product> {
        self.products
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(InventoryError::ProductNotFound(id))
    }

    async fn save(&self, product: &Product) -> InventoryResult<bool> {
        let mut products = self.products.lock().unwrap();
        let stored = products
            .get(&product.id)
            .ok_or(InventoryError::ProductNotFound(product.id))?;
        if stored.row_version != product.row_version {
            return Ok(false);
        }
        let mut next = product.clone();
        next.row_version += 1;
        products.insert(product.id, next);
        Ok(true)
    }

    /// The in-memory store has no row locks to take, so `tx` is accepted
    /// for signature parity with `SqlxProductRepository` and otherwise
    /// ignored; the read is identical to `get`.
    async fn get_for_update(&self, _tx: &mut Transaction<'_, Postgres>, id: Uuid) -> InventoryResult<Product> {
        self.get(id).await
    }

    /// See `get_for_update` — `tx` is accepted and ignored, the guarded
    /// update is identical to `save`.
    async fn save_in_tx(&self, _tx: &mut Transaction<'_, Postgres>, product: &Product) -> InventoryResult<bool> {
        self.save(product).await
    }

    async fn list_with_overdue_reservations(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> InventoryResult<Vec<Uuid>> {
        Ok(self
            .products
            .lock()
            .unwrap()
            .values()
            .filter(|p| {
                p.reservations
                    .iter()
                    .any(|r| matches!(r.status, inventory_reservation::ReservationStatus::Active) && r.expires_at < now)
            })
            .map(|p| p.id)
            .collect())
    }
}

/// Backs [`dead_letter_queue::DlqRepository`]. Enforces the same terminal-
/// status guard on `transition` as `SqlxDlqRepository` so a test asserting
/// that a `Resolved` row can't be reopened exercises real logic, not a stub.
#[derive(Default)]
pub struct InMemoryDlqRepository {
    rows: Mutex<HashMap<Uuid, DeadLetterMessage>>,
}

impl InMemoryDlqRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqRepository for InMemoryDlqRepository {
    async fn quarantine(&self, message: DeadLetterMessage) -> DlqResult<Uuid> {
        let id = message.id;
        self.rows.lock().unwrap().insert(id, message);
        Ok(id)
    }

    async fn list(&self, filter: &DlqFilter) -> DlqResult<Vec<DeadLetterMessage>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| filter.status.map_or(true, |s| s == row.status))
            .filter(|row| filter.consumer.as_deref().map_or(true, |c| c == row.consumer))
            .filter(|row| filter.event_type.as_deref().map_or(true, |t| t == row.event_type))
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> DlqResult<DeadLetterMessage> {
        self.rows.lock().unwrap().get(&id).cloned().ok_or(DlqError::NotFound(id))
    }

    async fn transition(&self, id: Uuid, to: DlqStatus) -> DlqResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if matches!(row.status, DlqStatus::Resolved | DlqStatus::Discarded) {
            return Err(DlqError::Terminal(id));
        }
        row.status = to;
        Ok(())
    }
}

/// Records every message handed to [`transactional_outbox::OutboxPublisher`]
/// or [`event_bus::BusProducer`] instead of putting it on a broker, so a
/// test can assert on what would have been published.
#[derive(Default)]
pub struct InMemoryBus {
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl transactional_outbox::OutboxPublisher for InMemoryBus {
    async fn publish(&self, message: &transactional_outbox::OutboxMessage) -> transactional_outbox::OutboxResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((message.event_type.clone(), message.payload.clone()));
        Ok(())
    }
}

#[async_trait]
impl event_bus::BusProducer for InMemoryBus {
    async fn publish(&self, _topic: &str, message: &event_bus::OutgoingMessage) -> event_bus::BusResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((message.event_type.clone(), message.payload.clone()));
        Ok(())
    }
}

/// Backs [`transactional_outbox::DlqSink`] over an [`InMemoryDlqRepository`],
/// the in-memory counterpart of `dead_letter_queue::OutboxDlqAdapter`.
pub struct InMemoryDlqSink {
    repo: std::sync::Arc<InMemoryDlqRepository>,
}

impl InMemoryDlqSink {
    pub fn new(repo: std::sync::Arc<InMemoryDlqRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl transactional_outbox::DlqSink for InMemoryDlqSink {
    async fn quarantine(&self, request: transactional_outbox::QuarantineRequest) -> transactional_outbox::OutboxResult<()> {
        self.repo
            .quarantine(DeadLetterMessage {
                id: request.message_id,
                event_id: Some(request.message_id),
                event_type: request.event_type,
                payload: request.payload,
                failed_at: chrono::Utc::now(),
                original_topic: request.topic,
                consumer: "outbox-processor".to_string(),
                error_kind: "PublishExhausted".to_string(),
                error_message: request.error_message,
                stack_trace: None,
                attempt_count: request.attempt_count,
                status: DlqStatus::Quarantined,
            })
            .await
            .map_err(|e| transactional_outbox::OutboxError::Other(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use saga_orchestrator::{advance, SagaAction, SagaInstance};

    #[tokio::test]
    async fn saga_repository_round_trips_and_enforces_version() {
        let repo = InMemorySagaRepository::new();
        let saga = SagaInstance::new_order_creation("corr-1", serde_json::json!({}));
        repo.create(&saga).await.unwrap();

        let fetched = repo.get(saga.id).await.unwrap();
        assert_eq!(fetched.version, 0);

        repo.update(&fetched).await.unwrap();
        let stale_update = repo.update(&fetched).await;
        assert!(matches!(stale_update, Err(SagaError::VersionConflict(_))));
    }

    #[tokio::test]
    async fn saga_repository_drives_advance_through_reserve_inventory() {
        let repo = InMemorySagaRepository::new();
        let mut saga = SagaInstance::new_order_creation("corr-2", serde_json::json!({}));
        repo.create(&saga).await.unwrap();

        let action = advance(&mut saga, "InventoryReservationConfirmed", "ReserveInventory");
        assert_eq!(
            action,
            SagaAction::EmitForward {
                command: "PaymentRequested"
            }
        );
        repo.update(&saga).await.unwrap();
    }

    #[tokio::test]
    async fn product_repository_detects_lost_concurrency_race() {
        let repo = InMemoryProductRepository::new();
        let product_id = Uuid::new_v4();
        repo.seed(Product {
            id: product_id,
            sku: "WIDGET-1".to_string(),
            name: "Widget".to_string(),
            stock_quantity: 10,
            reserved_quantity: 0,
            reorder_level: 2,
            reorder_quantity: 50,
            last_restock_at: None,
            reservations: Vec::new(),
            row_version: 0,
        });

        let mut stale = repo.get(product_id).await.unwrap();
        let fresh = repo.get(product_id).await.unwrap();
        repo.save(&fresh).await.unwrap();

        stale.stock_quantity -= 1;
        let saved = repo.save(&stale).await.unwrap();
        assert!(!saved);
    }

    #[tokio::test]
    async fn dlq_repository_rejects_transition_out_of_terminal_status() {
        let repo = InMemoryDlqRepository::new();
        let id = repo
            .quarantine(DeadLetterMessage {
                id: Uuid::new_v4(),
                event_id: Some(Uuid::new_v4()),
                event_type: "OrderCreated".to_string(),
                payload: serde_json::json!({}),
                failed_at: Utc::now(),
                original_topic: "commerce.order-service.events".to_string(),
                consumer: "inventory-service".to_string(),
                error_kind: "HandlerExhausted".to_string(),
                error_message: "boom".to_string(),
                stack_trace: None,
                attempt_count: 3,
                status: DlqStatus::Quarantined,
            })
            .await
            .unwrap();

        repo.transition(id, DlqStatus::Resolved).await.unwrap();
        let result = repo.transition(id, DlqStatus::Quarantined).await;
        assert!(matches!(result, Err(DlqError::Terminal(_))));
    }

    #[tokio::test]
    async fn in_memory_bus_records_published_messages() {
        let bus = InMemoryBus::new();
        let message = transactional_outbox::OutboxMessage {
            id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            event_type: "OrderCreated".to_string(),
            payload: serde_json::json!({"orderId": "abc"}),
            occurred_at: Utc::now(),
            correlation_id: "corr-3".to_string(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
        };

        transactional_outbox::OutboxPublisher::publish(&bus, &message).await.unwrap();
        assert_eq!(bus.published().len(), 1);
        assert_eq!(bus.published()[0].0, "OrderCreated");
    }
}
