use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::broker::{panic_message, validate_topic, Broker, Handler, Subscriber};
use crate::error::{BrokerError, Result};
use crate::logger::Logger;
use crate::message::{DeliveryState, Event, Message};
use crate::options::{
    BrokerOption, Options, PublishOption, PublishOptions, SubscribeOption, SubscribeOptions,
};

/// Per-topic channel capacity. A channel is dropped once its last
/// subscription ends.
const CHANNEL_BUFFER_SIZE: usize = 1024;
/// Settled deliveries kept per connection. Outstanding ones are kept until
/// they settle or the connection closes.
const LEDGER_HISTORY: usize = 1024;
const DEFAULT_ADDRESS: &str = "mem://local";
const SCHEME: &str = "mem";

/// Acknowledgment outcome of one delivery, as recorded by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub sequence: u64,
    pub topic: String,
    pub state: DeliveryState,
}

type Registry = Arc<DashMap<u64, CancellationToken>>;
type Channels = Arc<DashMap<String, broadcast::Sender<Arc<Message>>>>;

/// Delivery outcomes of one connection.
#[derive(Default)]
struct Ledger {
    records: DashMap<u64, DeliveryRecord>,
    settled: Mutex<VecDeque<u64>>,
}

impl Ledger {
    fn record(&self, sequence: u64, topic: &str) {
        self.records.insert(
            sequence,
            DeliveryRecord {
                sequence,
                topic: topic.to_string(),
                state: DeliveryState::Delivered,
            },
        );
    }

    /// Move a delivery out of `Delivered`. Returns false if it already left it.
    fn settle(&self, sequence: u64, to: DeliveryState) -> bool {
        let moved = match self.records.get_mut(&sequence) {
            Some(mut record) if record.state == DeliveryState::Delivered => {
                record.state = to;
                true
            }
            _ => false,
        };
        if moved {
            self.retire(sequence);
        }
        moved
    }

    /// Manual acknowledgment. Acking twice is fine; acking after the
    /// connection closed or after a nack is not.
    fn ack(&self, sequence: u64, closed: bool) -> Result<()> {
        let moved = match self.records.get_mut(&sequence) {
            None => Err(BrokerError::Ack(format!("unknown delivery {sequence}"))),
            Some(mut record) => {
                let state = record.state;
                match state {
                    DeliveryState::ManuallyAcked => Ok(false),
                    DeliveryState::Delivered if closed => Err(BrokerError::Ack(format!(
                        "connection closed before delivery {sequence} was acked"
                    ))),
                    DeliveryState::Delivered => {
                        record.state = DeliveryState::ManuallyAcked;
                        Ok(true)
                    }
                    state => Err(BrokerError::Ack(format!(
                        "delivery {sequence} already {state:?}"
                    ))),
                }
            }
        };
        if moved? {
            self.retire(sequence);
        }
        Ok(())
    }

    fn retire(&self, sequence: u64) {
        let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        settled.push_back(sequence);
        while settled.len() > LEDGER_HISTORY {
            if let Some(oldest) = settled.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }

    fn snapshot(&self) -> Vec<DeliveryRecord> {
        let mut records: Vec<DeliveryRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.sequence);
        records
    }
}

/// State that only exists between `connect` and `disconnect`.
struct Connection {
    token: CancellationToken,
    channels: Channels,
    subscribers: Registry,
    ledger: Arc<Ledger>,
}

impl Connection {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            channels: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            ledger: Arc::new(Ledger::default()),
        }
    }

    /// Attach a receiver while holding the topic's entry, so pruning cannot
    /// race a new subscription.
    fn subscribe_channel(&self, topic: &str) -> broadcast::Receiver<Arc<Message>> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER_SIZE).0)
            .subscribe()
    }
}

/// Broker backed by per-topic broadcast channels.
///
/// Every subscription runs on its own task and handles its events one at a
/// time, in publish order. Messages published while nobody is subscribed are
/// dropped.
pub struct InMemoryBroker {
    options: RwLock<Options>,
    connection: Mutex<Option<Connection>>,
    next_subscriber: AtomicU64,
    sequence: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new(opts: Vec<BrokerOption>) -> Self {
        Self {
            options: RwLock::new(Options::new(opts)),
            connection: Mutex::new(None),
            next_subscriber: AtomicU64::new(0),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock_connection().is_some()
    }

    /// Number of live subscriptions on the current connection.
    pub fn subscriber_count(&self) -> usize {
        self.lock_connection()
            .as_ref()
            .map(|conn| conn.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscription attached.
    pub fn topic_count(&self) -> usize {
        self.lock_connection()
            .as_ref()
            .map(|conn| conn.channels.len())
            .unwrap_or(0)
    }

    /// Deliveries on the current connection, ordered by sequence. Holds every
    /// outstanding delivery and the most recent settled ones.
    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.lock_connection()
            .as_ref()
            .map(|conn| conn.ledger.snapshot())
            .unwrap_or_default()
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn logger(&self) -> Arc<dyn Logger> {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .logger
            .clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Display for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory")
    }
}

fn check_scheme(options: &Options) -> Result<()> {
    for addr in &options.brokers {
        let scheme = url::Url::parse(addr)
            .map(|u| u.scheme().to_string())
            .map_err(|e| BrokerError::Configuration(format!("invalid broker address {addr:?}: {e}")))?;
        if scheme != SCHEME {
            return Err(BrokerError::Configuration(format!(
                "memory broker cannot serve {addr:?}: expected {SCHEME}:// address"
            )));
        }
    }
    Ok(())
}

struct InMemoryEvent {
    sequence: u64,
    topic: String,
    message: Arc<Message>,
    auto_ack: bool,
    connection: CancellationToken,
    ledger: Arc<Ledger>,
}

#[async_trait]
impl Event for InMemoryEvent {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn message(&self) -> &Message {
        &self.message
    }

    async fn ack(&self) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.ledger
            .ack(self.sequence, self.connection.is_cancelled())
    }

    fn error(&self) -> Option<&BrokerError> {
        None
    }
}

struct InMemorySubscriber {
    id: u64,
    topic: String,
    options: SubscribeOptions,
    token: CancellationToken,
    registry: Registry,
    logger: Arc<dyn Logger>,
}

#[async_trait]
impl Subscriber for InMemorySubscriber {
    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.token.cancel();
        if self.registry.remove(&self.id).is_some() {
            self.logger
                .debugf(format_args!("unsubscribed {} from {}", self.id, self.topic));
        }
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
    channels: Channels,
    ledger: Arc<Ledger>,
    sequence: Arc<AtomicU64>,
    logger: Arc<dyn Logger>,
}

impl Dispatcher {
    async fn run(self, mut rx: broadcast::Receiver<Arc<Message>>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                err = self.options.context.done() => {
                    self.logger.debugf(format_args!(
                        "subscription {} on {} stopped: {}", self.id, self.topic, err
                    ));
                    break;
                }
                recv = rx.recv() => match recv {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.logger.warnf(format_args!(
                            "subscription {} on {} lagged, {} messages skipped",
                            self.id, self.topic, skipped
                        ));
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            self.deliver(message).await;
        }
        self.registry.remove(&self.id);

        drop(rx);
        self.channels
            .remove_if(&self.topic, |_, tx| tx.receiver_count() == 0);
    }

    async fn deliver(&self, message: Arc<Message>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.ledger.record(sequence, &self.topic);

        let event = Arc::new(InMemoryEvent {
            sequence,
            topic: self.topic.clone(),
            message,
            auto_ack: self.options.auto_ack,
            connection: self.connection.clone(),
            ledger: self.ledger.clone(),
        });

        let outcome = AssertUnwindSafe(self.handler.handle(event))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                if self.options.auto_ack {
                    self.ledger.settle(sequence, DeliveryState::AutoAcked);
                }
            }
            Ok(Err(e)) => {
                if self.ledger.settle(sequence, DeliveryState::Nacked) {
                    self.logger.warnf(format_args!(
                        "handler failed for delivery {} on {}: {}",
                        sequence, self.topic, e
                    ));
                }
            }
            Err(payload) => {
                self.ledger.settle(sequence, DeliveryState::Nacked);
                self.logger.errorf(format_args!(
                    "handler panicked on delivery {} on {}: {}",
                    sequence,
                    self.topic,
                    panic_message(payload.as_ref())
                ));
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
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
        if self.is_connected() {
            return Ok(());
        }
        let options = self.options();
        options.validate()?;
        check_scheme(&options)?;
        if let Some(err) = options.context.err() {
            return Err(err);
        }

        let mut connection = self.lock_connection();
        if connection.is_some() {
            return Ok(());
        }
        *connection = Some(Connection::new());
        options
            .logger
            .infof(format_args!("memory broker connected ({})", self.brokers()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(connection) = self.lock_connection().take() else {
            return Ok(());
        };
        connection.token.cancel();
        let live = connection.subscribers.len();
        connection.subscribers.clear();
        self.logger().infof(format_args!(
            "memory broker disconnected, {live} subscriptions closed"
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

        let tx = match self.lock_connection().as_ref() {
            Some(conn) => conn.channels.get(topic).map(|tx| tx.clone()),
            None => return Err(BrokerError::Publish("not connected".to_string())),
        };
        let receivers = tx
            .map(|tx| tx.send(Arc::new(message)).unwrap_or(0))
            .unwrap_or(0);
        self.logger().debugf(format_args!(
            "published to {topic}, {receivers} subscriptions"
        ));
        Ok(())
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
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let guard = self.lock_connection();
        let Some(conn) = guard.as_ref() else {
            return Err(BrokerError::Subscription("not connected".to_string()));
        };
        let rx = conn.subscribe_channel(&topic);
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
            channels: conn.channels.clone(),
            ledger: conn.ledger.clone(),
            sequence: self.sequence.clone(),
            logger: logger.clone(),
        };
        let registry = conn.subscribers.clone();
        drop(guard);

        tokio::spawn(dispatcher.run(rx));
        logger.debugf(format_args!("subscription {id} registered on {topic}"));

        Ok(Box::new(InMemorySubscriber {
            id,
            topic,
            options,
            token,
            registry,
            logger,
        }))
    }
}
