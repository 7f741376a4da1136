use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_nats::{Client, ConnectOptions, HeaderMap, ServerAddr};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::{panic_message, validate_topic, Broker, Handler, Subscriber};
use crate::error::{BrokerError, Result};
use crate::logger::Logger;
use crate::message::{Event, Message};
use crate::options::{
    BrokerOption, Options, PublishOption, PublishOptions, SubscribeOption, SubscribeOptions,
};

const DEFAULT_ADDRESS: &str = "nats://127.0.0.1:4222";
const SCHEMES: [&str; 2] = ["nats", "tls"];

type Registry = Arc<DashMap<u64, CancellationToken>>;

struct NatsConnection {
    client: Client,
    token: CancellationToken,
    subscribers: Registry,
}

/// Core NATS backend.
///
/// Core NATS has no broker-side acknowledgment, so `Event::ack` is recorded
/// locally and handler failures are only logged.
pub struct NatsBroker {
    options: RwLock<Options>,
    connection: Mutex<Option<NatsConnection>>,
    next_subscriber: AtomicU64,
}

impl NatsBroker {
    pub fn new(opts: Vec<BrokerOption>) -> Self {
        Self {
            options: RwLock::new(Options::new(opts)),
            connection: Mutex::new(None),
            next_subscriber: AtomicU64::new(0),
        }
    }

    /// Client of the live connection, if any
    pub async fn client(&self) -> Option<Client> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.client.clone())
    }

    fn logger(&self) -> Arc<dyn Logger> {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .logger
            .clone()
    }
}

impl Default for NatsBroker {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Display for NatsBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("nats")
    }
}

fn server_addrs(options: &Options) -> Result<Vec<ServerAddr>> {
    if options.brokers.is_empty() {
        return DEFAULT_ADDRESS
            .parse::<ServerAddr>()
            .map(|addr| vec![addr])
            .map_err(|e| BrokerError::Configuration(e.to_string()));
    }
    options
        .brokers
        .iter()
        .map(|addr| {
            let scheme = url::Url::parse(addr)
                .map(|u| u.scheme().to_string())
                .map_err(|e| {
                    BrokerError::Configuration(format!("invalid broker address {addr:?}: {e}"))
                })?;
            if !SCHEMES.contains(&scheme.as_str()) {
                return Err(BrokerError::Configuration(format!(
                    "nats broker cannot serve {addr:?}"
                )));
            }
            addr.parse::<ServerAddr>().map_err(|e| {
                BrokerError::Configuration(format!("invalid broker address {addr:?}: {e}"))
            })
        })
        .collect()
}

fn connect_options(options: &Options) -> ConnectOptions {
    let logger = options.logger.clone();
    let mut connect = ConnectOptions::new()
        .require_tls(options.secure)
        .event_callback(move |event| {
            let logger = logger.clone();
            async move {
                logger.infof(format_args!("nats connection event: {event}"));
            }
        });

    if options.secure {
        if let Some(tls) = &options.tls_config {
            if let Some(ca) = &tls.ca_file {
                connect = connect.add_root_certificates(ca.clone());
            }
            if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
                connect = connect.add_client_certificate(cert.clone(), key.clone());
            }
        }
    }
    connect
}

fn header_map(header: &HashMap<String, String>) -> HeaderMap {
    let mut nats_headers = HeaderMap::new();
    for (k, v) in header {
        nats_headers.insert(k.as_str(), v.as_str());
    }
    nats_headers
}

/// Flatten NATS headers into a `Message` header. Repeated header values keep
/// the first one and are reported as a decode error.
fn decode_headers(headers: Option<&HeaderMap>) -> (HashMap<String, String>, Option<BrokerError>) {
    let mut header = HashMap::new();
    let mut error = None;
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if values.len() > 1 {
                error = Some(BrokerError::Decode(format!(
                    "header {name} carries {} values, kept the first",
                    values.len()
                )));
            }
            if let Some(value) = values.first() {
                header.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }
    (header, error)
}

struct NatsEvent {
    topic: String,
    message: Message,
    error: Option<BrokerError>,
    auto_ack: bool,
    acked: AtomicBool,
    connection: CancellationToken,
}

#[async_trait]
impl Event for NatsEvent {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn message(&self) -> &Message {
        &self.message
    }

    async fn ack(&self) -> Result<()> {
        if self.auto_ack || self.acked.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.connection.is_cancelled() {
            return Err(BrokerError::Ack("connection closed".to_string()));
        }
        self.acked.store(true, Ordering::Release);
        Ok(())
    }

    fn error(&self) -> Option<&BrokerError> {
        self.error.as_ref()
    }
}

struct NatsSubscriber {
    id: u64,
    topic: String,
    options: SubscribeOptions,
    token: CancellationToken,
    registry: Registry,
}

#[async_trait]
impl Subscriber for NatsSubscriber {
    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self) -> Result<()> {
        // The dispatch task owns the NATS subscription and unsubscribes it on exit.
        self.token.cancel();
        self.registry.remove(&self.id);
        Ok(())
    }
}

struct Dispatcher {
    id: u64,
    topic: String,
    options: SubscribeOptions,
    token: CancellationToken,
    connection: CancellationToken,
    handler: Arc<dyn Handler>,
    registry: Registry,
    logger: Arc<dyn Logger>,
}

impl Dispatcher {
    async fn run(self, mut subscription: async_nats::Subscriber) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                err = self.options.context.done() => {
                    self.logger.debugf(format_args!(
                        "subscription {} on {} stopped: {}", self.id, self.topic, err
                    ));
                    break;
                }
                next = subscription.next() => match next {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.deliver(msg).await;
        }

        if let Err(e) = subscription.unsubscribe().await {
            self.logger
                .debugf(format_args!("unsubscribe of {} failed: {}", self.topic, e));
        }
        self.registry.remove(&self.id);
    }

    async fn deliver(&self, msg: async_nats::Message) {
        let (header, error) = decode_headers(msg.headers.as_ref());
        let event = Arc::new(NatsEvent {
            topic: msg.subject.to_string(),
            message: Message {
                header,
                body: msg.payload,
            },
            error,
            auto_ack: self.options.auto_ack,
            acked: AtomicBool::new(false),
            connection: self.connection.clone(),
        });

        let outcome = AssertUnwindSafe(self.handler.handle(event.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                if self.options.auto_ack {
                    event.acked.store(true, Ordering::Release);
                }
            }
            Ok(Err(e)) => {
                if !event.acked.load(Ordering::Acquire) {
                    self.logger.warnf(format_args!(
                        "handler failed on {}: {}",
                        event.topic, e
                    ));
                }
            }
            Err(payload) => {
                self.logger.errorf(format_args!(
                    "handler panicked on {}: {}",
                    event.topic,
                    panic_message(payload.as_ref())
                ));
            }
        }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn init(&self, opts: Vec<BrokerOption>) -> Result<()> {
        let mut options = self.options.write().unwrap_or_else(PoisonError::into_inner);
        let mut candidate = options.clone();
        candidate.apply(opts);
        candidate.validate()?;
        *options = candidate;
        Ok(())
    }

    fn options(&self) -> Options {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn brokers(&self) -> String {
        let options = self.options.read().unwrap_or_else(PoisonError::into_inner);
        if options.brokers.is_empty() {
            DEFAULT_ADDRESS.to_string()
        } else {
            options.brokers.join(",")
        }
    }

    async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }

        let options = self.options();
        options.validate()?;
        let servers = server_addrs(&options)?;

        let client = options
            .context
            .run(async_nats::connect_with_options(servers.as_slice(), connect_options(&options)))
            .await?
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        *connection = Some(NatsConnection {
            client,
            token: CancellationToken::new(),
            subscribers: Arc::new(DashMap::new()),
        });
        options
            .logger
            .infof(format_args!("nats broker connected ({})", self.brokers()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        connection.token.cancel();
        let live = connection.subscribers.len();
        connection.subscribers.clear();

        connection
            .client
            .flush()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        self.logger().infof(format_args!(
            "nats broker disconnected, {live} subscriptions closed"
        ));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        message: Message,
        opts: Vec<PublishOption>,
    ) -> Result<()> {
        validate_topic(topic)?;
        let opts = PublishOptions::new(opts);
        if let Some(err) = opts.context.err() {
            return Err(err);
        }

        let client = self
            .client()
            .await
            .ok_or_else(|| BrokerError::Publish("not connected".to_string()))?;

        let sent = if message.header.is_empty() {
            opts.context
                .run(client.publish(topic.to_string(), message.body))
                .await?
        } else {
            opts.context
                .run(client.publish_with_headers(
                    topic.to_string(),
                    header_map(&message.header),
                    message.body,
                ))
                .await?
        };
        sent.map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        opts: Vec<SubscribeOption>,
    ) -> Result<Box<dyn Subscriber>> {
        let options = SubscribeOptions::new(opts);
        let topic = options.effective_topic(topic).to_string();
        if topic.is_empty() {
            return Err(BrokerError::Subscription("topic must not be empty".to_string()));
        }
        if let Some(err) = options.context.err() {
            return Err(err);
        }

        let logger = self.logger();
        let connection = self.connection.lock().await;
        let conn = connection
            .as_ref()
            .ok_or_else(|| BrokerError::Subscription("not connected".to_string()))?;

        let subscription = options
            .context
            .run(conn.client.subscribe(topic.clone()))
            .await?
            .map_err(|e| BrokerError::Subscription(e.to_string()))?;

        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let token = conn.token.child_token();
        conn.subscribers.insert(id, token.clone());

        let dispatcher = Dispatcher {
            id,
            topic: topic.clone(),
            options: options.clone(),
            token: token.clone(),
            connection: conn.token.clone(),
            handler,
            registry: conn.subscribers.clone(),
            logger: logger.clone(),
        };
        let registry = conn.subscribers.clone();
        drop(connection);

        tokio::spawn(dispatcher.run(subscription));
        logger.debugf(format_args!("subscription {id} registered on {topic}"));

        Ok(Box::new(NatsSubscriber {
            id,
            topic,
            options,
            token,
            registry,
        }))
    }
}
