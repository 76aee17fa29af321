//! Error types for the transactional outbox library.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Message not found in outbox
    #[error("Outbox message not found: {0}")]
    MessageNotFound(Uuid),

    /// Failed to publish event to message broker
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<OutboxError> for commerce_error_handling::CoreError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::DatabaseError(e) => e.into(),
            OutboxError::MessageNotFound(id) => {
                commerce_error_handling::CoreError::NotFound(format!("outbox message {id}"))
            }
            OutboxError::PublishFailed(msg) => commerce_error_handling::CoreError::Transient(msg),
            OutboxError::SerializationError(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
            OutboxError::Other(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
        }
    }
}
