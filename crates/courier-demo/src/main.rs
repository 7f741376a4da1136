use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use courier_broker::options::{self, auto_ack, publish_context};
use courier_broker::{handler_fn, BrokerFactory, Context, Event, HandlerError, Message};
use courier_logger::{ApiLogger, LoggerOptions};
use courier_metadata::{BackendConfig, BrokerConfig, LoggingConfig};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "courier-demo")]
#[command(about = "Round-trip messages through a courier broker")]
struct Args {
    /// Path to broker config YAML. Uses an in-memory broker when omitted.
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "orders")]
    topic: String,

    /// Number of messages to publish
    #[arg(long, default_value_t = 1)]
    count: usize,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<BrokerConfig> {
    let Some(path) = path else {
        return Ok(BrokerConfig {
            name: "courier-demo".to_string(),
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
        });
    };
    let config = BrokerConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    tracing::info!(name = %config.name, backend = ?config.backend.backend_type, "Starting courier-demo");

    let mut logger_opts = LoggerOptions::from(&config.logging);
    logger_opts
        .initial_fields
        .entry("release".to_string())
        .or_insert_with(|| serde_json::json!(env!("CARGO_PKG_VERSION")));
    let logger = ApiLogger::new(&logger_opts)?;

    let broker = BrokerFactory::create(&config.backend, vec![options::logger(logger.clone())])?;
    broker.connect().await?;
    logger.infof(format_args!("connected to {} via {}", broker.brokers(), broker));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |event: Arc<dyn Event>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((event.topic().to_string(), event.message().body.clone()));
            Ok::<(), HandlerError>(())
        }
    });
    let sub = broker
        .subscribe(&args.topic, Arc::new(handler), vec![auto_ack(true)])
        .await?;

    for i in 0..args.count {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let msg = Message::new(format!("message-{i}")).with_header("seq", i.to_string());
        broker
            .publish(&args.topic, msg, vec![publish_context(ctx)])
            .await?;
    }

    let mut received = 0;
    while received < args.count {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some((topic, body))) => {
                received += 1;
                logger.infof(format_args!(
                    "received {} on {}",
                    String::from_utf8_lossy(&body),
                    topic
                ));
            }
            Ok(None) => break,
            Err(_) => {
                logger.warnf(format_args!(
                    "timed out after {received} of {} messages",
                    args.count
                ));
                break;
            }
        }
    }

    sub.unsubscribe().await?;
    broker.disconnect().await?;
    logger.sync()?;

    tracing::info!(received, "courier-demo finished");
    Ok(())
}
