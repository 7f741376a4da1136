use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscription(String),
    #[error("ack failed: {0}")]
    Ack(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
    #[error("timeout")]
    Timeout,
}

impl BrokerError {
    /// True for the two context-driven failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BrokerError::Cancelled | BrokerError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error returned by a subscription handler. Never reaches the publisher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("flush failed: {0}")]
    Flush(#[from] std::io::Error),
    #[error("logger build failed: {0}")]
    Build(String),
}
