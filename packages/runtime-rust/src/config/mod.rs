//! Dynamic configuration with listener propagation.
//!
//! A [`DynamicConfiguration`] holds at most one backend watch per key and
//! fans remote changes out to [`ConfigurationListener`]s. Reads are point
//! reads against the backend and are never cached.

pub mod listener;
pub mod memory;
pub mod parser;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use xmicro_core::constants::DEFAULT_GROUP;
use xmicro_core::{ChangeEvent, Url};

pub use listener::{ChangeCallback, ConfigSource, ListeningConfiguration};
pub use memory::{MemoryConfigSource, MemoryConfigurationFactory};
pub use parser::{ConfigurationParser, PropertiesParser};

/// Default timeout for backend round-trips.
pub const DEFAULT_CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration {key:?} not found in group {group:?}")]
    NotFound { key: String, group: String },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("configuration backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("configuration backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Receives configuration change events.
pub trait ConfigurationListener: Send + Sync {
    fn process(&self, event: &ChangeEvent);
}

impl<F> ConfigurationListener for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn process(&self, event: &ChangeEvent) {
        self(event);
    }
}

/// Options shared by listener and read operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOptions {
    pub group: String,
    pub timeout: Duration,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            timeout: DEFAULT_CONFIG_TIMEOUT,
        }
    }
}

impl ConfigOptions {
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
pub trait DynamicConfiguration: Send + Sync {
    fn parser(&self) -> Arc<dyn ConfigurationParser>;

    fn set_parser(&self, parser: Arc<dyn ConfigurationParser>);

    /// Starts propagating changes of `key` to `listener`.
    ///
    /// Only the first registration for a key reaches the backend; later
    /// ones are logged and ignored.
    async fn add_listener(
        &self,
        key: &str,
        listener: Arc<dyn ConfigurationListener>,
        opts: ConfigOptions,
    ) -> Result<(), ConfigError>;

    /// Not supported by the backends; logs a warning and returns.
    fn remove_listener(&self, key: &str, listener: &Arc<dyn ConfigurationListener>, opts: ConfigOptions);

    async fn get_properties(&self, key: &str, opts: ConfigOptions) -> Result<String, ConfigError>;

    /// Same read as [`get_properties`](DynamicConfiguration::get_properties),
    /// used for routing and governance rules.
    async fn get_rule(&self, key: &str, opts: ConfigOptions) -> Result<String, ConfigError>;

    /// Looks `key` up inside the group's parsed default configuration file.
    async fn get_internal_property(&self, key: &str, opts: ConfigOptions) -> Result<String, ConfigError>;

    async fn publish_config(&self, key: &str, group: &str, value: &str) -> Result<(), ConfigError>;

    async fn remove_config(&self, key: &str, group: &str) -> Result<(), ConfigError>;

    async fn get_config_keys_by_group(&self, group: &str) -> Result<Vec<String>, ConfigError>;
}

impl fmt::Debug for dyn DynamicConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicConfiguration").finish_non_exhaustive()
    }
}

/// Builds a dynamic configuration from a config-center URL.
pub trait DynamicConfigurationFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the backend cannot be configured from `url`.
    fn get_dynamic_configuration(&self, url: &Url) -> Result<Arc<dyn DynamicConfiguration>, ConfigError>;
}
