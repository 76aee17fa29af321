//! Error types for the inbox library.

use thiserror::Error;

pub type InboxResult<T> = Result<T, InboxError>;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Spec §9 open question: `consumer` is required and non-empty, not
    /// defaulted to the empty string the source tolerated.
    #[error("consumer identity must be a non-empty string")]
    MissingConsumer,

    /// The row for `(event_id, consumer)` exists but is not in a state the
    /// caller may act on (e.g. `Failed` with no retries left).
    #[error("event {event_id} for consumer {consumer} is poisoned and will not be retried")]
    Poison { event_id: uuid::Uuid, consumer: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<InboxError> for commerce_error_handling::CoreError {
    fn from(err: InboxError) -> Self {
        let message = err.to_string();
        match err {
            InboxError::Database(e) => e.into(),
            InboxError::Json(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
            InboxError::MissingConsumer => commerce_error_handling::CoreError::Validation(message),
            InboxError::Poison { .. } => commerce_error_handling::CoreError::Poison(message),
            InboxError::Other(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
        }
    }
}
