//! Error types for the event bus client.

use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<BusError> for commerce_error_handling::CoreError {
    fn from(err: BusError) -> Self {
        let message = err.to_string();
        match err {
            BusError::Kafka(_) => commerce_error_handling::CoreError::Transient(message),
            BusError::Serialization(_) => commerce_error_handling::CoreError::Unexpected(message),
            BusError::MissingHeader(_) => commerce_error_handling::CoreError::Validation(message),
            BusError::Other(e) => commerce_error_handling::CoreError::Unexpected(e.to_string()),
        }
    }
}
