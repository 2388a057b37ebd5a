//! Service configuration.

use camino::Utf8PathBuf;
use serde::Deserialize;

use registry_sync::SyncConfig;
use store::StoreConfig;

use crate::error::{RegistryError, RegistryResult};

/// Top-level configuration for the registry service.
///
/// ```toml
/// seed = "/etc/registry/seed.json"
///
/// [store]
/// backend = "json-file"
/// path = "/var/lib/registry/servers.json"
///
/// [sync]
/// enabled = true
/// queue-url = "https://sqs.us-east-1.amazonaws.com/123456789012/registry"
/// max-messages = 1
/// wait-seconds = 20
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Which backend holds the registry.
    pub store: StoreConfig,

    /// Snapshot sync for the embedded backend.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Servers to publish at startup, skipping versions already present.
    #[serde(default)]
    pub seed: Option<Utf8PathBuf>,
}

impl RegistryConfig {
    /// Reject combinations the service cannot run.
    pub fn validate(&self) -> RegistryResult<()> {
        if !self.sync.enabled {
            return Ok(());
        }

        if !matches!(self.store, StoreConfig::JsonFile { .. }) {
            return Err(RegistryError::Configuration(
                "sync requires the json-file store backend".into(),
            ));
        }

        if self
            .sync
            .queue_url
            .as_deref()
            .map_or(true, |url| url.trim().is_empty())
        {
            return Err(RegistryError::Configuration(
                "sync is enabled but no queue-url is set".into(),
            ));
        }

        Ok(())
    }
}
