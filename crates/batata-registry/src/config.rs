//! Registry configuration
//!
//! All settings are optional. `RegistryConfig::load` layers an optional file
//! and `BATATA_REGISTRY__*` environment variables on top of the defaults.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Root of the key layout when no namespace is configured
pub const DEFAULT_NAMESPACE: &str = "/batata/registry";

/// Default registration TTL in seconds
pub const DEFAULT_TTL_SECS: u64 = 10;

/// Smallest TTL the coordination store can honour
pub const MIN_TTL: Duration = Duration::from_secs(1);

/// Default delay before re-opening a failed watch, in milliseconds
pub const DEFAULT_WATCH_RETRY_INTERVAL_MS: u64 = 1000;

/// Default capacity of each watch subscription's event queue
pub const DEFAULT_WATCH_BUFFER_SIZE: usize = 128;

/// Environment variable prefix
const ENV_PREFIX: &str = "BATATA_REGISTRY";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Key prefix under which services are stored
    pub namespace: String,
    /// TTL applied when `register` is called with a zero TTL
    pub default_ttl_secs: u64,
    /// Delay before re-opening a watch after an error
    pub watch_retry_interval_ms: u64,
    /// Bounded queue size per watch subscription
    pub watch_buffer_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            watch_retry_interval_ms: DEFAULT_WATCH_RETRY_INTERVAL_MS,
            watch_buffer_size: DEFAULT_WATCH_BUFFER_SIZE,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from an optional file plus the environment.
    ///
    /// Environment keys use `__` as separator, e.g.
    /// `BATATA_REGISTRY__DEFAULT_TTL_SECS=30`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RegistryConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_watch_retry_interval(mut self, interval: Duration) -> Self {
        self.watch_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_watch_buffer_size(mut self, size: usize) -> Self {
        self.watch_buffer_size = size;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn watch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.watch_retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim_matches('/').is_empty() {
            return Err(RegistryError::Config(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.default_ttl() < MIN_TTL {
            return Err(RegistryError::Config(format!(
                "default TTL must be at least {:?}",
                MIN_TTL
            )));
        }
        if self.watch_buffer_size == 0 {
            return Err(RegistryError::Config(
                "watch buffer size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
