//! Application configuration.
//!
//! Plain structs with serde derives and sensible defaults; loading them from
//! a file or the environment is left to the caller. Durations are kept as
//! strings (`"5s"`, `"100ms"`, `"10m"`, `"1h"`) and validated when the
//! configuration is turned into backend URLs or service options.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use xmicro_core::constants::{
    CONFIG_APP_ID_KEY, CONFIG_CLUSTER_KEY, CONFIG_GROUP_KEY, CONFIG_LOG_DIR_KEY, CONFIG_NAMESPACE_KEY,
    CONFIG_TIMEOUT_KEY, DEFAULT_CONFIG_FILE, DEFAULT_CONFIG_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_GROUP,
    DEFAULT_NAMESPACE, DEFAULT_REGISTER_INTERVAL_SECS, DEFAULT_REGISTER_TTL_SECS, DEFAULT_REGISTRY_TIMEOUT,
    DEFAULT_REGISTRY_TTL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVER_ADDRESS, DEFAULT_SERVER_NAME,
    DEFAULT_SERVER_VERSION, GROUP_KEY, MAX_REQUEST_TIMEOUT_SECS, MEMORY_KEY, RANDOM_SELECTOR, REGISTRY_KEY,
    REGISTRY_PREFERRED_KEY, REGISTRY_TIMEOUT_KEY, REGISTRY_TTL_KEY, REGISTRY_ZONE_KEY, SIMPLIFIED_KEY,
};
use xmicro_core::Url;

use crate::component::{try_get_config_center_factory, try_get_registry_factory, ComponentError};
use crate::config::{ConfigError, ConfigOptions, DynamicConfiguration};
use crate::registry::{Registry, RegistryError};
use crate::selector::{new_selector, SelectorError};
use crate::service::{options, ServiceOption};

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("request timeout {0:?} must be below {max}s", max = MAX_REQUEST_TIMEOUT_SECS)]
    RequestTimeoutTooLarge(Duration),
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// Parses `<integer><unit>` with unit `ms`, `s`, `m` or `h`. A bare integer
/// is taken as seconds.
///
/// # Errors
///
/// Returns [`ConfigurationError::InvalidDuration`] for anything else.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigurationError> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let invalid = || ConfigurationError::InvalidDuration(raw.to_string());

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => value.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Registry factory name in the component locator.
    pub protocol: String,
    /// `host:port`, or a comma-separated list.
    pub address: String,
    pub timeout: String,
    pub group: String,
    /// Node time-to-live handed to the backend.
    pub ttl: String,
    pub username: String,
    pub password: String,
    pub zone: String,
    pub preferred: bool,
    /// Register only the service name and address, without metadata.
    pub simplified: bool,
    /// Extra backend-specific parameters, passed through unmodified.
    pub params: BTreeMap<String, String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            protocol: MEMORY_KEY.to_string(),
            address: String::new(),
            timeout: DEFAULT_REGISTRY_TIMEOUT.to_string(),
            group: String::new(),
            ttl: DEFAULT_REGISTRY_TTL.to_string(),
            username: String::new(),
            password: String::new(),
            zone: String::new(),
            preferred: false,
            simplified: false,
            params: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    /// URL handed to the registry factory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidDuration`] for a malformed
    /// `timeout` or `ttl`.
    pub fn to_url(&self) -> Result<Url, ConfigurationError> {
        parse_duration(&self.timeout)?;
        parse_duration(&self.ttl)?;

        let mut url = Url::new(&self.protocol, &self.address)
            .with_credentials(&self.username, &self.password)
            .with_param(REGISTRY_KEY, &self.protocol)
            .with_param(REGISTRY_TIMEOUT_KEY, &self.timeout)
            .with_param(REGISTRY_TTL_KEY, &self.ttl)
            .with_param(REGISTRY_PREFERRED_KEY, self.preferred.to_string())
            .with_param(SIMPLIFIED_KEY, self.simplified.to_string());
        if !self.group.is_empty() {
            url = url.with_param(GROUP_KEY, &self.group);
        }
        if !self.zone.is_empty() {
            url = url.with_param(REGISTRY_ZONE_KEY, &self.zone);
        }
        Ok(url.with_params(self.params.clone()))
    }
}

/// Resolves the registry factory named by `config.protocol` and builds a
/// registry from it.
///
/// # Errors
///
/// Fails if the configuration is malformed, no factory is registered under
/// the protocol, or the factory rejects the URL.
pub fn build_registry(config: &RegistryConfig) -> Result<Arc<dyn Registry>, ConfigurationError> {
    let url = config.to_url()?;
    let factory = try_get_registry_factory(&config.protocol)?;
    let registry = factory.get_registry(&url)?;
    info!(protocol = %config.protocol, address = %config.address, "registry ready");
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Config center
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigCenterConfig {
    pub protocol: String,
    pub address: String,
    pub cluster: String,
    pub group: String,
    pub namespace: String,
    pub app_id: String,
    pub username: String,
    pub password: String,
    pub log_dir: String,
    /// Key of the properties file read by `get_internal_property`.
    pub config_file: String,
    pub timeout: String,
}

impl Default for ConfigCenterConfig {
    fn default() -> Self {
        Self {
            protocol: MEMORY_KEY.to_string(),
            address: String::new(),
            cluster: String::new(),
            group: DEFAULT_GROUP.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            app_id: String::new(),
            username: String::new(),
            password: String::new(),
            log_dir: String::new(),
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            timeout: DEFAULT_CONFIG_TIMEOUT.to_string(),
        }
    }
}

impl ConfigCenterConfig {
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidDuration`] for a malformed
    /// `timeout`.
    pub fn to_url(&self) -> Result<Url, ConfigurationError> {
        parse_duration(&self.timeout)?;

        let mut url = Url::new(&self.protocol, &self.address)
            .with_credentials(&self.username, &self.password)
            .with_path(&self.config_file)
            .with_param(CONFIG_NAMESPACE_KEY, &self.namespace)
            .with_param(CONFIG_GROUP_KEY, &self.group)
            .with_param(CONFIG_TIMEOUT_KEY, &self.timeout);
        for (key, value) in [
            (CONFIG_CLUSTER_KEY, &self.cluster),
            (CONFIG_APP_ID_KEY, &self.app_id),
            (CONFIG_LOG_DIR_KEY, &self.log_dir),
        ] {
            if !value.is_empty() {
                url = url.with_param(key, value);
            }
        }
        Ok(url)
    }

    /// Group and timeout for listener and read calls.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidDuration`] for a malformed
    /// `timeout`.
    pub fn options(&self) -> Result<ConfigOptions, ConfigurationError> {
        Ok(ConfigOptions::default()
            .with_group(&self.group)
            .with_timeout(parse_duration(&self.timeout)?))
    }
}

/// Resolves the config-center factory named by `config.protocol` and
/// connects a dynamic configuration through it.
///
/// # Errors
///
/// Fails if the configuration is malformed, no factory is registered under
/// the protocol, or the factory rejects the URL.
pub fn start_config_center(config: &ConfigCenterConfig) -> Result<Arc<dyn DynamicConfiguration>, ConfigurationError> {
    let url = config.to_url()?;
    let factory = try_get_config_center_factory(&config.protocol)?;
    let dynamic = factory.get_dynamic_configuration(&url)?;
    info!(protocol = %config.protocol, namespace = %config.namespace, "config center ready");
    Ok(dynamic)
}

// ---------------------------------------------------------------------------
// Client and server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub connect_timeout: String,
    pub request_timeout: String,
    /// Selector strategy name.
    pub selector: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT.to_string(),
            selector: RANDOM_SELECTOR.to_string(),
        }
    }
}

impl ClientConfig {
    /// # Errors
    ///
    /// Fails on malformed durations, a request timeout of 900 s or more, or
    /// an unknown selector.
    pub fn service_options(&self) -> Result<Vec<ServiceOption>, ConfigurationError> {
        let connect_timeout = parse_duration(&self.connect_timeout)?;
        let request_timeout = parse_duration(&self.request_timeout)?;
        if request_timeout >= Duration::from_secs(MAX_REQUEST_TIMEOUT_SECS) {
            return Err(ConfigurationError::RequestTimeoutTooLarge(request_timeout));
        }
        Ok(vec![
            options::connect_timeout(connect_timeout),
            options::request_timeout(request_timeout),
            options::selector(new_selector(&self.selector)?),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub address: String,
    pub register_interval: String,
    pub register_ttl: String,
    pub metadata: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            version: DEFAULT_SERVER_VERSION.to_string(),
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            register_interval: format!("{DEFAULT_REGISTER_INTERVAL_SECS}s"),
            register_ttl: format!("{DEFAULT_REGISTER_TTL_SECS}s"),
            metadata: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidDuration`] for a malformed
    /// registration interval or TTL.
    pub fn service_options(&self) -> Result<Vec<ServiceOption>, ConfigurationError> {
        Ok(vec![
            options::name(&self.name),
            options::version(&self.version),
            options::address(&self.address),
            options::register_interval(parse_duration(&self.register_interval)?),
            options::register_ttl(parse_duration(&self.register_ttl)?),
            options::metadata(self.metadata.clone()),
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub registry: RegistryConfig,
    pub config_center: ConfigCenterConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl ApplicationConfig {
    /// Service options for the whole application, registry included.
    ///
    /// # Errors
    ///
    /// Propagates any error from the sections or from building the registry.
    pub fn service_options(&self) -> Result<Vec<ServiceOption>, ConfigurationError> {
        let mut opts = vec![options::registry(build_registry(&self.registry)?)];
        opts.extend(self.server.service_options()?);
        opts.extend(self.client.service_options()?);
        Ok(opts)
    }
}
