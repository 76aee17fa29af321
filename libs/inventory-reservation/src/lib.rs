//! # Inventory Reservation Engine
//!
//! The local algorithm that makes a saga's `ReserveInventory` step correct:
//! a `Product` aggregate tracking on-hand stock and a set of per-order
//! `StockReservation`s, mutated through `reserve`/`confirm`/`release`/
//! `expire_due`/`adjust`, each re-read and re-applied under optimistic
//! concurrency on `row_version`.
//!
//! | Op | Precondition | Postcondition |
//! |---|---|---|
//! | `reserve` | `quantity > 0 ∧ available ≥ quantity` | new `Active` reservation; `reserved_quantity += quantity`; emits `StockReserved` (+ `LowStockDetected` if `available ≤ reorder_level`) |
//! | `confirm` | `Active` reservation exists for the order | reservation → `Confirmed`; `stock_quantity -= quantity`; `reserved_quantity -= quantity`; emits `StockDeducted` |
//! | `release` | `Active` reservation exists for the order | reservation → `Released`; `reserved_quantity -= quantity`; emits `StockReleased` |
//! | `expire_due` | any `Active` reservation past `expires_at` | each → `Expired`; `reserved_quantity -= quantity`; emits `ReservationExpired` |
//! | `adjust` | `reason` non-empty ∧ `stock_quantity + delta ≥ 0` | `stock_quantity += delta`; `last_restock_at = now` if `delta > 0`; emits `StockAdjusted` |

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

mod error;

pub use error::{InventoryError, InventoryResult};

/// A reservation stays `Active` for 15 minutes unless confirmed, released,
/// or it expires first.
pub const DEFAULT_RESERVATION_TTL: ChronoDuration = ChronoDuration::minutes(15);

/// Bounded application-layer retries for a lost optimistic-concurrency
/// race, per product mutating operation.
pub const MAX_CONCURRENCY_RETRIES: u32 = 3;

/// Minimum tick interval for the background expiration worker.
pub const MIN_EXPIRATION_SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Confirmed,
    Released,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservation {
    pub reservation_id: Uuid,
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Domain events emitted by product mutations. Serialized straight into an
/// outbox row's `payload` by the caller — this crate has no opinion on how
/// they're published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InventoryEvent {
    StockReserved {
        product_id: Uuid,
        order_id: Uuid,
        quantity: i32,
        new_available: i32,
    },
    LowStockDetected {
        product_id: Uuid,
        available: i32,
        reorder_level: i32,
    },
    StockDeducted {
        product_id: Uuid,
        order_id: Uuid,
        quantity: i32,
        new_stock_quantity: i32,
    },
    StockReleased {
        product_id: Uuid,
        order_id: Uuid,
        quantity: i32,
    },
    ReservationExpired {
        product_id: Uuid,
        order_id: Uuid,
        quantity: i32,
    },
    StockAdjusted {
        product_id: Uuid,
        delta: i32,
        reason: String,
        new_stock_quantity: i32,
    },
}

/// The inventory aggregate: on-hand stock plus the reservations drawn
/// against it. `row_version` backs optimistic concurrency in the
/// repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub stock_quantity: i32,
    pub reserved_quantity: i32,
    pub reorder_level: i32,
    pub reorder_quantity: i32,
    pub last_restock_at: Option<DateTime<Utc>>,
    pub reservations: Vec<StockReservation>,
    pub row_version: i32,
}

impl Product {
    pub fn available_quantity(&self) -> i32 {
        self.stock_quantity - self.reserved_quantity
    }

    fn active_reservation_mut(&mut self, order_id: Uuid) -> Option<&mut StockReservation> {
        self.reservations
            .iter_mut()
            .find(|r| r.order_id == order_id && matches!(r.status, ReservationStatus::Active))
    }

    pub fn reserve(&mut self, order_id: Uuid, quantity: i32, ttl: ChronoDuration) -> InventoryResult<Vec<InventoryEvent>> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity);
        }
        let available = self.available_quantity();
        if quantity > available {
            return Err(InventoryError::InsufficientStock {
                product_id: self.id,
                available,
                requested: quantity,
            });
        }

        let now = Utc::now();
        self.reservations.push(StockReservation {
            reservation_id: Uuid::new_v4(),
            product_id: self.id,
            order_id,
            quantity,
            status: ReservationStatus::Active,
            reserved_at: now,
            expires_at: now + ttl,
            confirmed_at: None,
            released_at: None,
        });
        self.reserved_quantity += quantity;

        let new_available = self.available_quantity();
        let mut events = vec![InventoryEvent::StockReserved {
            product_id: self.id,
            order_id,
            quantity,
            new_available,
        }];

        if new_available <= self.reorder_level {
            events.push(InventoryEvent::LowStockDetected {
                product_id: self.id,
                available: new_available,
                reorder_level: self.reorder_level,
            });
        }

        Ok(events)
    }

    pub fn confirm(&mut self, order_id: Uuid) -> InventoryResult<Vec<InventoryEvent>> {
        let quantity = {
            let reservation = self
                .active_reservation_mut(order_id)
                .ok_or(InventoryError::ReservationNotFound(order_id))?;
            reservation.status = ReservationStatus::Confirmed;
            reservation.confirmed_at = Some(Utc::now());
            reservation.quantity
        };

        self.stock_quantity -= quantity;
        self.reserved_quantity -= quantity;

        Ok(vec![InventoryEvent::StockDeducted {
            product_id: self.id,
            order_id,
            quantity,
            new_stock_quantity: self.stock_quantity,
        }])
    }

    pub fn release(&mut self, order_id: Uuid) -> InventoryResult<Vec<InventoryEvent>> {
        let quantity = {
            let reservation = self
                .active_reservation_mut(order_id)
                .ok_or(InventoryError::ReservationNotFound(order_id))?;
            reservation.status = ReservationStatus::Released;
            reservation.released_at = Some(Utc::now());
            reservation.quantity
        };

        self.reserved_quantity -= quantity;

        Ok(vec![InventoryEvent::StockReleased {
            product_id: self.id,
            order_id,
            quantity,
        }])
    }

    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<InventoryEvent> {
        let mut events = Vec::new();
        for reservation in self.reservations.iter_mut() {
            if matches!(reservation.status, ReservationStatus::Active) && now > reservation.expires_at {
                reservation.status = ReservationStatus::Expired;
                self.reserved_quantity -= reservation.quantity;
                events.push(InventoryEvent::ReservationExpired {
                    product_id: self.id,
                    order_id: reservation.order_id,
                    quantity: reservation.quantity,
                });
            }
        }
        events
    }

    pub fn adjust(&mut self, delta: i32, reason: &str) -> InventoryResult<Vec<InventoryEvent>> {
        if reason.trim().is_empty() {
            return Err(InventoryError::MissingAdjustmentReason);
        }
        if self.stock_quantity + delta < 0 {
            return Err(InventoryError::AdjustmentUnderflow);
        }

        self.stock_quantity += delta;
        if delta > 0 {
            self.last_restock_at = Some(Utc::now());
        }

        Ok(vec![InventoryEvent::StockAdjusted {
            product_id: self.id,
            delta,
            reason: reason.to_string(),
            new_stock_quantity: self.stock_quantity,
        }])
    }
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> InventoryResult<Product>;
    /// Persist `product` if `row_version` still matches the stored row,
    /// bumping it by one; returns `Ok(false)` on a lost race rather than an
    /// error, so callers can distinguish "retry" from "give up".
    async fn save(&self, product: &Product) -> InventoryResult<bool>;
    /// Same read as [`ProductRepository::get`], but locks the row
    /// (`SELECT ... FOR UPDATE`) inside the caller's transaction so nothing
    /// else can mutate it before [`ProductRepository::save_in_tx`] commits.
    async fn get_for_update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> InventoryResult<Product>;
    /// Same guarded update as [`ProductRepository::save`], scoped to the
    /// caller's transaction so it commits atomically with the outbox rows
    /// and inbox mark the caller writes alongside it.
    async fn save_in_tx(&self, tx: &mut Transaction<'_, Postgres>, product: &Product) -> InventoryResult<bool>;
    async fn list_with_overdue_reservations(&self, now: DateTime<Utc>) -> InventoryResult<Vec<Uuid>>;
}

pub struct SqlxProductRepository {
    pool: PgPool,
}

impl SqlxProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_product(row: &sqlx::postgres::PgRow) -> Result<Product, sqlx::Error> {
        let reservations: serde_json::Value = row.try_get("reservations")?;
        Ok(Product {
            id: row.try_get("id")?,
            sku: row.try_get("sku")?,
            name: row.try_get("name")?,
            stock_quantity: row.try_get("stock_quantity")?,
            reserved_quantity: row.try_get("reserved_quantity")?,
            reorder_level: row.try_get("reorder_level")?,
            reorder_quantity: row.try_get("reorder_quantity")?,
            last_restock_at: row.try_get("last_restock_at")?,
            reservations: serde_json::from_value(reservations).unwrap_or_default(),
            row_version: row.try_get("row_version")?,
        })
    }
}

#[async_trait]
impl ProductRepository for SqlxProductRepository {
    async fn get(&self, id: Uuid) -> InventoryResult<Product> {
        let row = sqlx::query(
            r#"
            SELECT id, sku, name, stock_quantity, reserved_quantity, reorder_level,
                   reorder_quantity, last_restock_at, reservations, row_version
            FROM products WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(InventoryError::ProductNotFound(id))?;

        Self::row_to_product(&row).map_err(InventoryError::from)
    }

    async fn save(&self, product: &Product) -> InventoryResult<bool> {
        let reservations = serde_json::to_value(&product.reservations).map_err(anyhow::Error::from)?;
        let result = sqlx::query(
            r#"
            UPDATE products
            SET stock_quantity = $1, reserved_quantity = $2, reorder_level = $3,
                last_restock_at = $4, reservations = $5, row_version = row_version + 1
            WHERE id = $6 AND row_version = $7
            "#,
        )
        .bind(product.stock_quantity)
        .bind(product.reserved_quantity)
        .bind(product.reorder_level)
        .bind(product.last_restock_at)
        .bind(&reservations)
        .bind(product.id)
        .bind(product.row_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_for_update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> InventoryResult<Product> {
        let row = sqlx::query(
            r#"
            SELECT id, sku, name, stock_quantity, reserved_quantity, reorder_level,
                   reorder_quantity, last_restock_at, reservations, row_version
            FROM products WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(InventoryError::ProductNotFound(id))?;

        Self::row_to_product(&row).map_err(InventoryError::from)
    }

    async fn save_in_tx(&self, tx: &mut Transaction<'_, Postgres>, product: &Product) -> InventoryResult<bool> {
        let reservations = serde_json::to_value(&product.reservations).map_err(anyhow::Error::from)?;
        let result = sqlx::query(
            r#"
            UPDATE products
            SET stock_quantity = $1, reserved_quantity = $2, reorder_level = $3,
                last_restock_at = $4, reservations = $5, row_version = row_version + 1
            WHERE id = $6 AND row_version = $7
            "#,
        )
        .bind(product.stock_quantity)
        .bind(product.reserved_quantity)
        .bind(product.reorder_level)
        .bind(product.last_restock_at)
        .bind(&reservations)
        .bind(product.id)
        .bind(product.row_version)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_with_overdue_reservations(&self, now: DateTime<Utc>) -> InventoryResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.id
            FROM products p, jsonb_array_elements(p.reservations) AS r
            WHERE (r->>'status') = 'Active' AND (r->>'expiresAt')::timestamptz <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row.try_get::<Uuid, _>("id")).collect::<Result<Vec<_>, _>>().map_err(InventoryError::from)
    }
}

/// Re-read, apply `op`, and save under optimistic concurrency, retrying up
/// to [`MAX_CONCURRENCY_RETRIES`] times with jittered backoff on a lost
/// race. Business-rule errors (e.g. insufficient stock) are never retried
/// — only a lost `row_version` race is.
async fn mutate_with_retry<R, F>(repo: &R, product_id: Uuid, mut op: F) -> InventoryResult<Vec<InventoryEvent>>
where
    R: ProductRepository,
    F: FnMut(&mut Product) -> InventoryResult<Vec<InventoryEvent>>,
{
    for attempt in 0..=MAX_CONCURRENCY_RETRIES {
        let mut product = repo.get(product_id).await?;
        let events = op(&mut product)?;

        if repo.save(&product).await? {
            return Ok(events);
        }

        if attempt == MAX_CONCURRENCY_RETRIES {
            return Err(InventoryError::ConcurrencyConflict(product_id));
        }

        let backoff = jittered_backoff(attempt);
        warn!(product_id = %product_id, attempt, backoff_ms = backoff.as_millis() as u64, "lost optimistic concurrency race, retrying");
        tokio::time::sleep(backoff).await;
    }

    unreachable!("loop always returns or errors by the final iteration")
}

fn jittered_backoff(attempt: u32) -> Duration {
    let base_ms = 50u64 * 2u64.saturating_pow(attempt);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

/// Lock, apply `op`, and save within the caller's transaction. The row lock
/// taken by `get_for_update` holds off concurrent mutators for the lifetime
/// of `tx`, so unlike [`mutate_with_retry`] there is no race to retry: a
/// lost `row_version` guard here means the row was changed by a writer this
/// lock should have excluded, and is treated as a hard conflict.
async fn mutate_in_tx<R, F>(
    repo: &R,
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    mut op: F,
) -> InventoryResult<Vec<InventoryEvent>>
where
    R: ProductRepository,
    F: FnMut(&mut Product) -> InventoryResult<Vec<InventoryEvent>>,
{
    let mut product = repo.get_for_update(tx, product_id).await?;
    let events = op(&mut product)?;

    if !repo.save_in_tx(tx, &product).await? {
        return Err(InventoryError::ConcurrencyConflict(product_id));
    }

    Ok(events)
}

pub async fn reserve<R: ProductRepository>(
    repo: &R,
    product_id: Uuid,
    order_id: Uuid,
    quantity: i32,
    ttl: ChronoDuration,
) -> InventoryResult<Vec<InventoryEvent>> {
    mutate_with_retry(repo, product_id, |product| product.reserve(order_id, quantity, ttl)).await
}

pub async fn confirm<R: ProductRepository>(repo: &R, product_id: Uuid, order_id: Uuid) -> InventoryResult<Vec<InventoryEvent>> {
    mutate_with_retry(repo, product_id, |product| product.confirm(order_id)).await
}

pub async fn release<R: ProductRepository>(repo: &R, product_id: Uuid, order_id: Uuid) -> InventoryResult<Vec<InventoryEvent>> {
    mutate_with_retry(repo, product_id, |product| product.release(order_id)).await
}

pub async fn adjust<R: ProductRepository>(repo: &R, product_id: Uuid, delta: i32, reason: &str) -> InventoryResult<Vec<InventoryEvent>> {
    mutate_with_retry(repo, product_id, |product| product.adjust(delta, reason)).await
}

/// Transaction-scoped sibling of [`reserve`] for callers that must commit
/// the mutation atomically with outbox rows and an inbox mark.
pub async fn reserve_in_tx<R: ProductRepository>(
    repo: &R,
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    order_id: Uuid,
    quantity: i32,
    ttl: ChronoDuration,
) -> InventoryResult<Vec<InventoryEvent>> {
    mutate_in_tx(repo, tx, product_id, |product| product.reserve(order_id, quantity, ttl)).await
}

/// Transaction-scoped sibling of [`confirm`].
pub async fn confirm_in_tx<R: ProductRepository>(
    repo: &R,
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    order_id: Uuid,
) -> InventoryResult<Vec<InventoryEvent>> {
    mutate_in_tx(repo, tx, product_id, |product| product.confirm(order_id)).await
}

/// Transaction-scoped sibling of [`release`].
pub async fn release_in_tx<R: ProductRepository>(
    repo: &R,
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    order_id: Uuid,
) -> InventoryResult<Vec<InventoryEvent>> {
    mutate_in_tx(repo, tx, product_id, |product| product.release(order_id)).await
}

/// Scan for products with overdue `Active` reservations and expire them.
/// Intended to be called on a `tokio::time::interval` tick of at least
/// [`MIN_EXPIRATION_SCAN_INTERVAL`].
pub async fn expire_due_reservations<R: ProductRepository>(repo: &R) -> InventoryResult<Vec<InventoryEvent>> {
    let now = Utc::now();
    let product_ids = repo.list_with_overdue_reservations(now).await?;
    let mut all_events = Vec::new();

    for product_id in product_ids {
        match mutate_with_retry(repo, product_id, |product| Ok(product.expire_due(now))).await {
            Ok(events) => all_events.extend(events),
            Err(e) => warn!(product_id = %product_id, error = ?e, "failed to expire reservations for product"),
        }
    }

    if !all_events.is_empty() {
        info!(expired_count = all_events.len(), "expired overdue reservations");
    }

    Ok(all_events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_product() -> Product {
        Product {
            id: Uuid::new_v4(),
            sku: "WIDGET-1".to_string(),
            name: "Widget".to_string(),
            stock_quantity: 100,
            reserved_quantity: 0,
            reorder_level: 10,
            reorder_quantity: 50,
            last_restock_at: None,
            reservations: Vec::new(),
            row_version: 0,
        }
    }

    #[test]
    fn reserve_increases_reserved_quantity_and_emits_stock_reserved() {
        let mut product = fresh_product();
        let order_id = Uuid::new_v4();

        let events = product.reserve(order_id, 20, DEFAULT_RESERVATION_TTL).unwrap();

        assert_eq!(product.reserved_quantity, 20);
        assert_eq!(product.available_quantity(), 80);
        assert!(matches!(events[0], InventoryEvent::StockReserved { quantity: 20, .. }));
    }

    #[test]
    fn reserve_below_reorder_level_also_emits_low_stock_detected() {
        let mut product = fresh_product();
        product.stock_quantity = 15;
        let order_id = Uuid::new_v4();

        let events = product.reserve(order_id, 10, DEFAULT_RESERVATION_TTL).unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], InventoryEvent::LowStockDetected { .. }));
    }

    #[test]
    fn reserve_more_than_available_is_rejected() {
        let mut product = fresh_product();
        let order_id = Uuid::new_v4();

        let result = product.reserve(order_id, 200, DEFAULT_RESERVATION_TTL);
        assert!(matches!(result, Err(InventoryError::InsufficientStock { .. })));
    }

    #[test]
    fn reserve_with_non_positive_quantity_is_rejected() {
        let mut product = fresh_product();
        let result = product.reserve(Uuid::new_v4(), 0, DEFAULT_RESERVATION_TTL);
        assert!(matches!(result, Err(InventoryError::InvalidQuantity)));
    }

    #[test]
    fn confirm_deducts_stock_and_clears_reservation() {
        let mut product = fresh_product();
        let order_id = Uuid::new_v4();
        product.reserve(order_id, 20, DEFAULT_RESERVATION_TTL).unwrap();

        let events = product.confirm(order_id).unwrap();

        assert_eq!(product.stock_quantity, 80);
        assert_eq!(product.reserved_quantity, 0);
        assert!(matches!(events[0], InventoryEvent::StockDeducted { quantity: 20, .. }));
    }

    #[test]
    fn confirm_without_active_reservation_fails() {
        let mut product = fresh_product();
        let result = product.confirm(Uuid::new_v4());
        assert!(matches!(result, Err(InventoryError::ReservationNotFound(_))));
    }

    #[test]
    fn release_returns_reserved_quantity_without_touching_stock() {
        let mut product = fresh_product();
        let order_id = Uuid::new_v4();
        product.reserve(order_id, 20, DEFAULT_RESERVATION_TTL).unwrap();

        product.release(order_id).unwrap();

        assert_eq!(product.stock_quantity, 100);
        assert_eq!(product.reserved_quantity, 0);
    }

    #[test]
    fn expire_due_only_expires_reservations_past_their_deadline() {
        let mut product = fresh_product();
        let order_id = Uuid::new_v4();
        product.reserve(order_id, 20, ChronoDuration::seconds(-1)).unwrap();

        let events = product.expire_due(Utc::now());

        assert_eq!(product.reserved_quantity, 0);
        assert!(matches!(events[0], InventoryEvent::ReservationExpired { .. }));
    }

    #[test]
    fn expire_due_leaves_unexpired_reservations_active() {
        let mut product = fresh_product();
        let order_id = Uuid::new_v4();
        product.reserve(order_id, 20, DEFAULT_RESERVATION_TTL).unwrap();

        let events = product.expire_due(Utc::now());

        assert!(events.is_empty());
        assert_eq!(product.reserved_quantity, 20);
    }

    #[test]
    fn adjust_requires_a_non_empty_reason() {
        let mut product = fresh_product();
        let result = product.adjust(10, "");
        assert!(matches!(result, Err(InventoryError::MissingAdjustmentReason)));
    }

    #[test]
    fn adjust_rejects_negative_overflow_below_zero() {
        let mut product = fresh_product();
        let result = product.adjust(-200, "damaged stock");
        assert!(matches!(result, Err(InventoryError::AdjustmentUnderflow)));
    }

    #[test]
    fn positive_adjustment_sets_last_restock_at() {
        let mut product = fresh_product();
        assert!(product.last_restock_at.is_none());

        product.adjust(50, "restock").unwrap();

        assert_eq!(product.stock_quantity, 150);
        assert!(product.last_restock_at.is_some());
    }

    #[test]
    fn negative_adjustment_does_not_touch_last_restock_at() {
        let mut product = fresh_product();
        product.adjust(-50, "damaged in transit").unwrap();
        assert!(product.last_restock_at.is_none());
    }
}
