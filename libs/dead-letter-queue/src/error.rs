//! Error types for the dead-letter queue library.

use thiserror::Error;
use uuid::Uuid;

pub type DlqResult<T> = Result<T, DlqError>;

#[derive(Error, Debug)]
pub enum DlqError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dead-letter row not found: {0}")]
    NotFound(Uuid),

    /// A `Resolved`/`Discarded` row can never be re-quarantined or
    /// transitioned further.
    #[error("dead-letter row {0} is terminal and cannot be transitioned")]
    Terminal(Uuid),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<DlqError> for commerce_error_handling::CoreError {
    fn from(err: DlqError) -> Self {
        match err {
            DlqError::Database(e) => e.into(),
            DlqError::Json(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
            DlqError::NotFound(id) => commerce_error_handling::CoreError::NotFound(format!("dead-letter row {id}")),
            DlqError::Terminal(id) => commerce_error_handling::CoreError::Conflict(format!("dead-letter row {id} is terminal")),
            DlqError::Other(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
        }
    }
}
