//! Functional options for connections, publishes and subscriptions.
//!
//! Each option is a boxed transform over one field of its target record.
//! Options are applied left to right, so the last one touching a field wins.
//! Nothing here fails; `Options::validate` runs at init/connect time.

use std::fmt;
use std::sync::Arc;

pub use courier_metadata::TlsConfig;

use crate::context::Context;
use crate::error::{BrokerError, Result};
use crate::logger::{Logger, TracingLogger};

pub type BrokerOption = Box<dyn FnOnce(&mut Options) + Send>;
pub type PublishOption = Box<dyn FnOnce(&mut PublishOptions) + Send>;
pub type SubscribeOption = Box<dyn FnOnce(&mut SubscribeOptions) + Send>;

/// Connection-level configuration.
#[derive(Clone)]
pub struct Options {
    /// Addresses in connection priority order. Empty means backend default.
    pub brokers: Vec<String>,
    pub secure: bool,
    /// `None` with `secure` set means default TLS settings.
    pub tls_config: Option<TlsConfig>,
    pub logger: Arc<dyn Logger>,
    pub context: Context,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            secure: false,
            tls_config: None,
            logger: Arc::new(TracingLogger),
            context: Context::background(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("brokers", &self.brokers)
            .field("secure", &self.secure)
            .field("tls_config", &self.tls_config)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn new<I>(opts: I) -> Self
    where
        I: IntoIterator<Item = BrokerOption>,
    {
        let mut options = Self::default();
        options.apply(opts);
        options
    }

    pub fn apply<I>(&mut self, opts: I)
    where
        I: IntoIterator<Item = BrokerOption>,
    {
        for opt in opts {
            opt(self);
        }
    }

    /// Check the record for combinations no backend can satisfy.
    pub fn validate(&self) -> Result<()> {
        for addr in &self.brokers {
            if addr.trim().is_empty() {
                return Err(BrokerError::Configuration(
                    "broker address must not be empty".to_string(),
                ));
            }
            url::Url::parse(addr).map_err(|e| {
                BrokerError::Configuration(format!("invalid broker address {addr:?}: {e}"))
            })?;
        }

        if let Some(tls) = &self.tls_config {
            match (&tls.cert_file, &tls.key_file) {
                (Some(_), None) => {
                    return Err(BrokerError::Configuration(
                        "client certificate given without a key".to_string(),
                    ))
                }
                (None, Some(_)) => {
                    return Err(BrokerError::Configuration(
                        "client key given without a certificate".to_string(),
                    ))
                }
                _ => {}
            }
            for path in tls.files() {
                if !path.exists() {
                    return Err(BrokerError::Configuration(format!(
                        "TLS file not found: {}",
                        path.display()
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub context: Context,
}

impl PublishOptions {
    pub fn new<I>(opts: I) -> Self
    where
        I: IntoIterator<Item = PublishOption>,
    {
        let mut options = Self::default();
        for opt in opts {
            opt(&mut options);
        }
        options
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Acknowledge automatically when the handler returns `Ok`.
    pub auto_ack: bool,
    /// Replaces the topic passed to `subscribe` when set.
    pub topic: Option<String>,
    pub context: Context,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            topic: None,
            context: Context::background(),
        }
    }
}

impl SubscribeOptions {
    pub fn new<I>(opts: I) -> Self
    where
        I: IntoIterator<Item = SubscribeOption>,
    {
        let mut options = Self::default();
        for opt in opts {
            opt(&mut options);
        }
        options
    }

    pub fn effective_topic<'a>(&'a self, requested: &'a str) -> &'a str {
        self.topic.as_deref().unwrap_or(requested)
    }
}

pub fn brokers<I, S>(addrs: I) -> BrokerOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
    Box::new(move |o: &mut Options| o.brokers = addrs)
}

pub fn secure(secure: bool) -> BrokerOption {
    Box::new(move |o: &mut Options| o.secure = secure)
}

pub fn tls_config(tls: TlsConfig) -> BrokerOption {
    Box::new(move |o: &mut Options| o.tls_config = Some(tls))
}

pub fn logger(logger: Arc<dyn Logger>) -> BrokerOption {
    Box::new(move |o: &mut Options| o.logger = logger)
}

pub fn context(ctx: Context) -> BrokerOption {
    Box::new(move |o: &mut Options| o.context = ctx)
}

pub fn publish_context(ctx: Context) -> PublishOption {
    Box::new(move |o: &mut PublishOptions| o.context = ctx)
}

pub fn auto_ack(auto: bool) -> SubscribeOption {
    Box::new(move |o: &mut SubscribeOptions| o.auto_ack = auto)
}

pub fn topic(topic: impl Into<String>) -> SubscribeOption {
    let topic = topic.into();
    Box::new(move |o: &mut SubscribeOptions| o.topic = Some(topic))
}

pub fn subscribe_context(ctx: Context) -> SubscribeOption {
    Box::new(move |o: &mut SubscribeOptions| o.context = ctx)
}
