//! courier-metadata: Configuration types shared by brokers, loggers and binaries

pub mod config;
pub mod error;
pub mod logging;

pub use config::{BackendConfig, BackendType, BrokerConfig, TlsConfig};
pub use error::MetadataError;
pub use logging::{Level, LoggingConfig};
