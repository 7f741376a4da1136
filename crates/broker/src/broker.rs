use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BrokerError, HandlerError, Result};
use crate::message::{Event, Message};
use crate::options::{BrokerOption, Options, PublishOption, SubscribeOption, SubscribeOptions};

/// Callback invoked once per delivered event.
///
/// Returning `Err` is a negative acknowledgment for that event; it is never
/// reported to the publisher.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<dyn Event>) -> std::result::Result<(), HandlerError>;
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Arc<dyn Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Arc<dyn Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Arc<dyn Event>) -> std::result::Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// Handle for one live subscription
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn options(&self) -> &SubscribeOptions;

    fn topic(&self) -> &str;

    /// Stop dispatching new events. Idempotent; a handler already running is
    /// left to finish.
    async fn unsubscribe(&self) -> Result<()>;
}

/// Pub/sub client contract shared by every backend.
///
/// `Display` yields the backend name.
#[async_trait]
pub trait Broker: fmt::Display + Send + Sync {
    /// Apply options on top of the current ones. Nothing is stored if the
    /// result fails validation.
    fn init(&self, opts: Vec<BrokerOption>) -> Result<()>;

    fn options(&self) -> Options;

    /// Effective addresses, comma separated.
    fn brokers(&self) -> String;

    /// Establish connectivity. A no-op when already connected.
    async fn connect(&self) -> Result<()>;

    /// Tear down the connection and every live subscription. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, message: Message, opts: Vec<PublishOption>)
        -> Result<()>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        opts: Vec<SubscribeOption>,
    ) -> Result<Box<dyn Subscriber>>;
}

pub(crate) fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(BrokerError::Validation("topic must not be empty".to_string()));
    }
    Ok(())
}

/// Text of a caught handler panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
