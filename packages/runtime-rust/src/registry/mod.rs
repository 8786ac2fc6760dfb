//! Service discovery abstraction.
//!
//! The kernel only ever talks to [`Registry`] and [`Watcher`]; concrete
//! backends (Nacos, etcd, Zookeeper, the in-process [`MemoryRegistry`]) are
//! resolved by name through the component locator and swapped transparently.
//!
//! State machine: `Unconfigured -> Configured -> Connected -> Closed`.
//! `register`/`deregister` change node membership without changing the
//! connection state.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use xmicro_core::{RegistryEvent, Service, Url};

pub use memory::{MemoryRegistry, MemoryRegistryFactory, MemoryWatcher};

/// Domain matching every domain in lookups.
pub const WILDCARD_DOMAIN: &str = "*";
/// Domain used when none is provided.
pub const DEFAULT_DOMAIN: &str = "micro";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service not found")]
    NotFound,
    #[error("watcher stopped")]
    WatcherStopped,
    #[error("service {service} has no nodes; at least one node is required")]
    NoNodes { service: String },
    #[error("node {node} has invalid address {address:?}, expected host:port")]
    InvalidAddress { node: String, address: String },
    #[error("registry is closed")]
    Closed,
    #[error("registry backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Connection state of a registry backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Unconfigured,
    Configured,
    Connected,
    Closed,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Backend-level options applied by [`Registry::init`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryOptions {
    pub addrs: Vec<String>,
    pub timeout: Duration,
    pub secure: bool,
    pub username: String,
    pub password: String,
    /// Backend-specific parameters, carried unmodified from the factory URL.
    pub params: BTreeMap<String, String>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            timeout: Duration::from_secs(1),
            secure: false,
            username: String::new(),
            password: String::new(),
            params: BTreeMap::new(),
        }
    }
}

/// Options for [`Registry::register`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterOptions {
    /// Nodes not re-registered within `ttl` expire. `None` never expires.
    pub ttl: Option<Duration>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeregisterOptions {
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    /// [`WILDCARD_DOMAIN`] searches every domain.
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub domain: Option<String>,
}

/// Options for [`Registry::watch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchOptions {
    /// Restricts events to one service name.
    pub service: Option<String>,
    pub domain: Option<String>,
}

/// Resolves the effective domain for an operation.
#[must_use]
pub fn domain_or_default(domain: Option<&str>) -> &str {
    match domain {
        Some(d) if !d.is_empty() => d,
        _ => DEFAULT_DOMAIN,
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Service discovery contract implemented by every registry backend.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Backend name, e.g. `"memory"` or `"nacos"`.
    fn name(&self) -> &'static str;

    /// Applies options, moving an unconfigured registry to `Configured`.
    /// A connected registry stays connected.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] once the registry has been closed.
    fn init(&self, options: RegistryOptions) -> Result<(), RegistryError>;

    fn options(&self) -> RegistryOptions;

    fn state(&self) -> RegistryState;

    /// Upserts the nodes of `service`.
    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<(), RegistryError>;

    /// Removes the nodes of `service`. Fails with [`RegistryError::NoNodes`]
    /// before any backend interaction when `service.nodes` is empty.
    async fn deregister(&self, service: &Service, opts: DeregisterOptions) -> Result<(), RegistryError>;

    /// Returns every service (one per version) registered under `name`.
    async fn get_service(&self, name: &str, opts: GetOptions) -> Result<Vec<Service>, RegistryError>;

    /// Enumerates distinct service names. Only `name` is populated.
    async fn list_services(&self, opts: ListOptions) -> Result<Vec<Service>, RegistryError>;

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>, RegistryError>;

    /// Ends the backend session; active watchers observe [`RegistryError::Closed`].
    async fn close(&self) -> Result<(), RegistryError>;
}

/// A live, cancellable stream of membership-change events.
///
/// Once stopped, a watcher cannot be restarted; create a new one.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Waits for the next event.
    ///
    /// Returns [`RegistryError::WatcherStopped`] after [`stop`](Watcher::stop).
    async fn next(&mut self) -> Result<RegistryEvent, RegistryError>;

    fn stop(&self);
}

/// Builds a registry from a backend URL. Registered with the component locator.
pub trait RegistryFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if the backend cannot be configured from `url`.
    fn get_registry(&self, url: &Url) -> Result<Arc<dyn Registry>, RegistryError>;
}

impl fmt::Debug for dyn Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Precondition shared by register and deregister: at least one node, and
/// every node address must be `host:port`.
///
/// # Errors
///
/// Returns [`RegistryError::NoNodes`] or [`RegistryError::InvalidAddress`].
pub fn validate_nodes(service: &Service) -> Result<(), RegistryError> {
    if service.nodes.is_empty() {
        return Err(RegistryError::NoNodes {
            service: service.name.clone(),
        });
    }
    for node in &service.nodes {
        if node.host_port().is_none() {
            return Err(RegistryError::InvalidAddress {
                node: node.id.clone(),
                address: node.address.clone(),
            });
        }
    }
    Ok(())
}
