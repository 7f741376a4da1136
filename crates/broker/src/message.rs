use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

use crate::error::{BrokerError, Result};

/// Payload unit exchanged through a broker. Body bytes are opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }
}

/// Acknowledgment outcome of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    AutoAcked,
    ManuallyAcked,
    Nacked,
}

impl DeliveryState {
    pub fn is_acked(self) -> bool {
        matches!(self, DeliveryState::AutoAcked | DeliveryState::ManuallyAcked)
    }
}

/// A received message as seen by a handler.
///
/// Built by the backend right before the handler runs and dropped after it
/// returns.
#[async_trait]
pub trait Event: Send + Sync {
    /// Topic the message was delivered on
    fn topic(&self) -> &str;

    fn message(&self) -> &Message;

    /// Acknowledge processing. Idempotent, and a no-op under auto-ack.
    async fn ack(&self) -> Result<()>;

    /// Set when delivery was degraded but a message could still be built.
    fn error(&self) -> Option<&BrokerError>;
}
