//! courier-broker: Transport-agnostic publish/subscribe client
//!
//! Application code talks to the [`Broker`] trait; backends (in-memory, NATS)
//! implement it. Configuration uses functional options from [`options`].

pub mod broker;
pub mod context;
pub mod error;
pub mod factory;
pub mod logger;
pub mod memory;
pub mod message;
pub mod nats;
pub mod options;

pub use broker::{handler_fn, Broker, Handler, HandlerFn, Subscriber};
pub use context::Context;
pub use error::{BrokerError, HandlerError, LoggerError, Result};
pub use factory::{BrokerFactory, FactoryError};
pub use logger::{Level, Logger, TracingLogger};
pub use memory::{DeliveryRecord, InMemoryBroker};
pub use message::{DeliveryState, Event, Message};
pub use nats::NatsBroker;
pub use options::{
    BrokerOption, Options, PublishOption, PublishOptions, SubscribeOption, SubscribeOptions,
    TlsConfig,
};
