//! Error types for the saga orchestrator.

use thiserror::Error;
use uuid::Uuid;

pub type SagaResult<T> = Result<T, SagaError>;

#[derive(Error, Debug)]
pub enum SagaError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("saga instance not found: {0}")]
    NotFound(Uuid),

    /// Raised by `SagaRepository::update` when the row's `version` no
    /// longer matches the version the caller read. Callers retry by
    /// re-reading the instance and recomputing the transition.
    #[error("saga {0} was concurrently modified, retry with the latest version")]
    VersionConflict(Uuid),

    #[error("event referenced step {referenced:?} but saga {saga_id} is at step {current:?}")]
    StepMismatch {
        saga_id: Uuid,
        current: String,
        referenced: String,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<SagaError> for commerce_error_handling::CoreError {
    fn from(err: SagaError) -> Self {
        let message = err.to_string();
        match err {
            SagaError::Database(e) => e.into(),
            SagaError::Json(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
            SagaError::NotFound(id) => commerce_error_handling::CoreError::NotFound(format!("saga instance {id}")),
            SagaError::VersionConflict(id) => {
                commerce_error_handling::CoreError::Conflict(format!("saga {id} was concurrently modified"))
            }
            SagaError::StepMismatch { .. } => commerce_error_handling::CoreError::Validation(message),
            SagaError::Other(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
        }
    }
}
