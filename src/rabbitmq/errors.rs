// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("No live RabbitMQ connection")]
    NotConnected,

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Failed to declare {0}")]
    DeclareError(String),

    #[error("Failed to bind queue: {0}")]
    BindError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Publish to '{exchange}' with key '{routing_key}' was rejected by the broker")]
    Nacked { exchange: String, routing_key: String },

    #[error("No publisher confirmation within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("RPC request timed out after {0:?}")]
    RpcTimeout(Duration),

    #[error("Subscription on queue '{0}' ended before it was cancelled")]
    SubscriptionClosed(String),

    #[error("Connection manager has been closed")]
    Closed,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Errors that a caller may reasonably retry once the connection is back.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::NotConnected
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::ConfirmTimeout(_)
                | RabbitMQError::SubscriptionClosed(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            RabbitMQError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else {
            RabbitMQError::Unknown(error_text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_classified() {
        assert!(RabbitMQError::NotConnected.is_transient());
        assert!(RabbitMQError::ConfirmTimeout(Duration::from_secs(5)).is_transient());
        assert!(!RabbitMQError::DeclareError("exchange 'logs'".into()).is_transient());
        assert!(!RabbitMQError::Nacked {
            exchange: "logs".into(),
            routing_key: "".into()
        }
        .is_transient());
    }

    #[test]
    fn nack_message_names_the_route() {
        let err = RabbitMQError::Nacked {
            exchange: "logs".into(),
            routing_key: "info".into(),
        };
        assert_eq!(
            err.to_string(),
            "Publish to 'logs' with key 'info' was rejected by the broker"
        );
    }
}
