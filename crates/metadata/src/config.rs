use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::MetadataError;
use crate::logging::LoggingConfig;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    #[default]
    Memory,
    Nats,
}

/// Certificate and trust files handed to the backend transport unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    /// Extra root certificates (PEM)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Client certificate for mutual TLS
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl TlsConfig {
    /// Every file path this configuration references.
    pub fn files(&self) -> impl Iterator<Item = &Path> + '_ {
        [&self.ca_file, &self.cert_file, &self.key_file]
            .into_iter()
            .flatten()
            .map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    /// Addresses in connection priority order. Empty means backend default.
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub name: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BrokerConfig {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.name.trim().is_empty() {
            return Err(MetadataError::Validation("name must not be empty".to_string()));
        }
        if self.backend.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(MetadataError::Validation(
                "backend.brokers must not contain empty addresses".to_string(),
            ));
        }
        Ok(())
    }
}
