use std::sync::Arc;

use courier_metadata::{BackendConfig, BackendType};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::memory::InMemoryBroker;
use crate::nats::NatsBroker;
use crate::options::{self, BrokerOption};

/// Error creating a broker
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("configuration error: {0}")]
    ConfigError(#[from] BrokerError),
}

/// Builds brokers from configuration files
pub struct BrokerFactory;

impl BrokerFactory {
    /// Connection options described by `config`, in application order.
    pub fn options_from(config: &BackendConfig) -> Vec<BrokerOption> {
        let mut opts = vec![
            options::brokers(config.brokers.clone()),
            options::secure(config.secure),
        ];
        if let Some(tls) = &config.tls {
            opts.push(options::tls_config(tls.clone()));
        }
        opts
    }

    /// Create an unconnected broker for `config`. `extra` options are applied
    /// after the ones derived from the config, so they win.
    pub fn create(
        config: &BackendConfig,
        extra: Vec<BrokerOption>,
    ) -> Result<Arc<dyn Broker>, FactoryError> {
        let broker: Arc<dyn Broker> = match config.backend_type {
            BackendType::Memory => Arc::new(InMemoryBroker::default()),
            BackendType::Nats => Arc::new(NatsBroker::default()),
        };

        let mut opts = Self::options_from(config);
        opts.extend(extra);
        broker.init(opts)?;
        Ok(broker)
    }
}
