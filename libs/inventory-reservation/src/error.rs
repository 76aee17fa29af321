//! Error types for the inventory reservation engine.

use thiserror::Error;
use uuid::Uuid;

pub type InventoryResult<T> = Result<T, InventoryError>;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("product {0} not found")]
    ProductNotFound(Uuid),

    #[error("no active reservation for order {0}")]
    ReservationNotFound(Uuid),

    #[error("insufficient available stock for product {product_id}: have {available}, need {requested}")]
    InsufficientStock {
        product_id: Uuid,
        available: i32,
        requested: i32,
    },

    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("adjustment reason must not be empty")]
    MissingAdjustmentReason,

    #[error("adjustment would take stock_quantity negative")]
    AdjustmentUnderflow,

    /// Surfaced once the bounded optimistic-concurrency retry budget is
    /// exhausted for a mutating operation.
    #[error("concurrency conflict on product {0} after exhausting the retry budget")]
    ConcurrencyConflict(Uuid),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<InventoryError> for commerce_error_handling::CoreError {
    fn from(err: InventoryError) -> Self {
        let message = err.to_string();
        match err {
            InventoryError::Database(e) => e.into(),
            InventoryError::ProductNotFound(_) => commerce_error_handling::CoreError::NotFound(message),
            InventoryError::ReservationNotFound(_) => commerce_error_handling::CoreError::NotFound(message),
            InventoryError::InsufficientStock { .. } => commerce_error_handling::CoreError::Validation(message),
            InventoryError::InvalidQuantity => commerce_error_handling::CoreError::Validation(message),
            InventoryError::MissingAdjustmentReason => commerce_error_handling::CoreError::Validation(message),
            InventoryError::AdjustmentUnderflow => commerce_error_handling::CoreError::Validation(message),
            InventoryError::ConcurrencyConflict(_) => commerce_error_handling::CoreError::Conflict(message),
            InventoryError::Other(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
        }
    }
}
