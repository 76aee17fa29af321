use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Inventory(#[from] inventory_reservation::InventoryError),

    #[error(transparent)]
    Outbox(#[from] transactional_outbox::OutboxError),

    #[error(transparent)]
    Inbox(#[from] inbox::InboxError),

    #[error(transparent)]
    Dlq(#[from] dead_letter_queue::DlqError),

    #[error(transparent)]
    Bus(#[from] event_bus::BusError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
