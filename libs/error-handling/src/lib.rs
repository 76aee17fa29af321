//! Cross-cutting error taxonomy for the commerce transaction core.
//!
//! Every crate in this workspace defines its own `thiserror`-derived error
//! type for its own boundary (`OutboxError`, `InboxError`, ...); this crate
//! defines the coarse *kind* each of those ultimately belongs to, so a call
//! site that only needs to know "retry or surface?" doesn't have to match on
//! every crate's variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error response shape for anything that crosses a process boundary as data
/// (a saga step's recorded failure reason, a DLQ entry's `error_kind`, a
/// future HTTP layer's JSON body). Internal detail is redacted outside
/// development via [`CoreError::to_response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub correlation_id: Option<String>,
}

/// The error kinds of spec §7, realized as a `thiserror` enum rather than a
/// bare string so call sites can classify a leaf error with `From` instead
/// of matching on every crate's own variants.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Request rejected before any effect took place.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Target entity missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or optimistic-concurrency violation.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    /// Network/broker/DB hiccup expected to succeed on retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The handler can never succeed for this payload; route to DLQ.
    #[error("poison payload: {0}")]
    Poison(String),

    /// Programmer error. Never silently swallowed.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl CoreError {
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Unauthorized => 401,
            CoreError::Forbidden => 403,
            CoreError::Transient(_) => 503,
            CoreError::Poison(_) => 422,
            CoreError::Unexpected(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Unauthorized => "UNAUTHORIZED",
            CoreError::Forbidden => "FORBIDDEN",
            CoreError::Transient(_) => "TRANSIENT",
            CoreError::Poison(_) => "POISON",
            CoreError::Unexpected(_) => "UNEXPECTED",
        }
    }

    /// Whether this kind is ever worth retrying internally before surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::Conflict(_))
    }

    pub fn to_response(&self, correlation_id: Option<String>) -> ErrorResponse {
        let message = match self {
            // Internal detail stays out of anything that leaves the process.
            CoreError::Unexpected(_) => "an unexpected error occurred".to_string(),
            other => other.to_string(),
        };
        ErrorResponse {
            code: self.code().to_string(),
            message,
            correlation_id,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                CoreError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => CoreError::Transient(err.to_string()),
            other => CoreError::Unexpected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(CoreError::NotFound("x".into()).status_code(), 404);
        assert_eq!(CoreError::Conflict("x".into()).status_code(), 409);
        assert_eq!(CoreError::Unauthorized.status_code(), 401);
    }

    #[test]
    fn transient_and_conflict_are_retryable() {
        assert!(CoreError::Transient("timeout".into()).is_retryable());
        assert!(CoreError::Conflict("version mismatch".into()).is_retryable());
        assert!(!CoreError::Poison("bad payload".into()).is_retryable());
    }

    #[test]
    fn unexpected_errors_redact_detail_in_response() {
        let err = CoreError::Unexpected("panic in handler X at line 42".into());
        let response = err.to_response(Some("corr-1".into()));
        assert_eq!(response.code, "UNEXPECTED");
        assert_eq!(response.message, "an unexpected error occurred");
        assert_eq!(response.correlation_id, Some("corr-1".into()));
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
