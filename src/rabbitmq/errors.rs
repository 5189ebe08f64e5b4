// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors surfaced by the provider.
///
/// Variants carry the rendered cause instead of the source error so the enum
/// stays `Clone`: a single in-flight connect or channel creation hands the
/// same outcome to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(String),

    #[error("RabbitMQ queue declare error: {0}")]
    DeclareError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Provider has been shut down")]
    ShutDown,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl From<SerdeError> for QueueError {
    fn from(error: SerdeError) -> Self {
        QueueError::SerializationError(error.to_string())
    }
}

impl From<Elapsed> for QueueError {
    fn from(_: Elapsed) -> Self {
        QueueError::TimeoutError("Connection timed out".to_string())
    }
}
