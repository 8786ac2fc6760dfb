//! Process-wide component locator.
//!
//! Backends register factories under a name during initialisation (usually
//! from `main`, or through [`install_defaults`]); configuration later picks
//! them by name. Tables are concurrent maps, so stray registration at
//! runtime is memory-safe, but nothing is ever removed.

use std::fmt;
use std::sync::{Arc, Once, OnceLock};

use dashmap::DashMap;
use tracing::debug;
use xmicro_core::constants::{DEFAULT_PROTOCOL, MEMORY_KEY};

use crate::auth::{RequireBearer, AUTH_WRAPPER};
use crate::client::ClientWrapper;
use crate::config::{DynamicConfigurationFactory, MemoryConfigurationFactory};
use crate::registry::{MemoryRegistryFactory, RegistryFactory};
use crate::server::HandlerWrapper;
use crate::service::{RpcServiceFactory, ServiceFactory};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComponentError {
    #[error("no {kind} factory registered under {name:?}")]
    FactoryNotRegistered { kind: &'static str, name: String },
}

// ---------------------------------------------------------------------------
// FactoryTable
// ---------------------------------------------------------------------------

/// Name to factory mapping for one component kind.
pub struct FactoryTable<F: ?Sized> {
    kind: &'static str,
    entries: DashMap<String, Arc<F>>,
}

impl<F: ?Sized> FactoryTable<F> {
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn set(&self, name: impl Into<String>, factory: Arc<F>) {
        let name = name.into();
        if self.entries.insert(name.clone(), factory).is_some() {
            debug!(kind = self.kind, %name, "factory replaced");
        } else {
            debug!(kind = self.kind, %name, "factory registered");
        }
    }

    /// # Errors
    ///
    /// Returns [`ComponentError::FactoryNotRegistered`] for an unknown name.
    pub fn try_get(&self, name: &str) -> Result<Arc<F>, ComponentError> {
        self.lookup(name).ok_or_else(|| ComponentError::FactoryNotRegistered {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    /// # Panics
    ///
    /// Panics when nothing is registered under `name`. A missing backend is a
    /// wiring mistake the process cannot recover from.
    #[must_use]
    pub fn get(&self, name: &str) -> Arc<F> {
        match self.try_get(name) {
            Ok(factory) => factory,
            Err(err) => panic!("{err}"),
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<F>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl<F: ?Sized> fmt::Debug for FactoryTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryTable")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentLocator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ComponentLocator {
    pub config_centers: FactoryTable<dyn DynamicConfigurationFactory>,
    pub registries: FactoryTable<dyn RegistryFactory>,
    pub services: FactoryTable<dyn ServiceFactory>,
    pub server_wrappers: FactoryTable<dyn HandlerWrapper>,
    pub client_wrappers: FactoryTable<dyn ClientWrapper>,
}

impl ComponentLocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config_centers: FactoryTable::new("config center"),
            registries: FactoryTable::new("registry"),
            services: FactoryTable::new("service"),
            server_wrappers: FactoryTable::new("server wrapper"),
            client_wrappers: FactoryTable::new("client wrapper"),
        }
    }
}

impl Default for ComponentLocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide locator.
pub fn locator() -> &'static ComponentLocator {
    static LOCATOR: OnceLock<ComponentLocator> = OnceLock::new();
    LOCATOR.get_or_init(ComponentLocator::new)
}

/// Registers the in-memory backends, the `"rpc"` service factory and the
/// `"auth"` server wrapper. Runs once per process.
pub fn install_defaults() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        set_registry_factory(MEMORY_KEY, Arc::new(MemoryRegistryFactory::new()));
        set_config_center_factory(MEMORY_KEY, Arc::new(MemoryConfigurationFactory::new()));
        set_service_factory(DEFAULT_PROTOCOL, Arc::new(RpcServiceFactory));
        set_server_wrapper(AUTH_WRAPPER, Arc::new(RequireBearer));
    });
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

pub fn set_config_center_factory(name: &str, factory: Arc<dyn DynamicConfigurationFactory>) {
    locator().config_centers.set(name, factory);
}

/// # Panics
///
/// Panics when no config-center factory is registered under `name`.
#[must_use]
pub fn get_config_center_factory(name: &str) -> Arc<dyn DynamicConfigurationFactory> {
    locator().config_centers.get(name)
}

/// # Errors
///
/// Returns [`ComponentError::FactoryNotRegistered`] for an unknown name.
pub fn try_get_config_center_factory(name: &str) -> Result<Arc<dyn DynamicConfigurationFactory>, ComponentError> {
    locator().config_centers.try_get(name)
}

pub fn set_registry_factory(name: &str, factory: Arc<dyn RegistryFactory>) {
    locator().registries.set(name, factory);
}

/// # Panics
///
/// Panics when no registry factory is registered under `name`.
#[must_use]
pub fn get_registry_factory(name: &str) -> Arc<dyn RegistryFactory> {
    locator().registries.get(name)
}

/// # Errors
///
/// Returns [`ComponentError::FactoryNotRegistered`] for an unknown name.
pub fn try_get_registry_factory(name: &str) -> Result<Arc<dyn RegistryFactory>, ComponentError> {
    locator().registries.try_get(name)
}

pub fn set_service_factory(name: &str, factory: Arc<dyn ServiceFactory>) {
    locator().services.set(name, factory);
}

/// # Panics
///
/// Panics when no service factory is registered under `name`.
#[must_use]
pub fn get_service_factory(name: &str) -> Arc<dyn ServiceFactory> {
    locator().services.get(name)
}

/// # Errors
///
/// Returns [`ComponentError::FactoryNotRegistered`] for an unknown name.
pub fn try_get_service_factory(name: &str) -> Result<Arc<dyn ServiceFactory>, ComponentError> {
    locator().services.try_get(name)
}

pub fn set_server_wrapper(name: &str, wrapper: Arc<dyn HandlerWrapper>) {
    locator().server_wrappers.set(name, wrapper);
}

/// Absence is normal for wrappers, so this never panics.
#[must_use]
pub fn server_wrapper(name: &str) -> Option<Arc<dyn HandlerWrapper>> {
    locator().server_wrappers.lookup(name)
}

pub fn set_client_wrapper(name: &str, wrapper: Arc<dyn ClientWrapper>) {
    locator().client_wrappers.set(name, wrapper);
}

#[must_use]
pub fn client_wrapper(name: &str) -> Option<Arc<dyn ClientWrapper>> {
    locator().client_wrappers.lookup(name)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use xmicro_core::Url;

    use super::*;
    use crate::auth::BearerTokenWrapper;
    use crate::registry::{MemoryRegistry, Registry, RegistryError};

    /// Counts how often it builds a registry.
    struct CountingRegistryFactory {
        built: AtomicUsize,
    }

    impl RegistryFactory for CountingRegistryFactory {
        fn get_registry(&self, _url: &Url) -> Result<Arc<dyn Registry>, RegistryError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MemoryRegistry::new()))
        }
    }

    #[test]
    fn set_then_get_returns_the_registered_factory() {
        let table: FactoryTable<dyn RegistryFactory> = FactoryTable::new("registry");
        let factory = Arc::new(CountingRegistryFactory {
            built: AtomicUsize::new(0),
        });
        table.set("counting", Arc::clone(&factory) as Arc<dyn RegistryFactory>);

        let got = table.get("counting");
        got.get_registry(&Url::new("counting", "")).unwrap();
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(table.names(), vec!["counting".to_string()]);
    }

    #[test]
    fn later_registration_overwrites() {
        let table: FactoryTable<dyn RegistryFactory> = FactoryTable::new("registry");
        let first = Arc::new(CountingRegistryFactory {
            built: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingRegistryFactory {
            built: AtomicUsize::new(0),
        });
        table.set("x", Arc::clone(&first) as Arc<dyn RegistryFactory>);
        table.set("x", Arc::clone(&second) as Arc<dyn RegistryFactory>);

        table.get("x").get_registry(&Url::new("x", "")).unwrap();
        assert_eq!(first.built.load(Ordering::SeqCst), 0);
        assert_eq!(second.built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_get_reports_kind_and_name() {
        let table: FactoryTable<dyn RegistryFactory> = FactoryTable::new("registry");
        let err = table.try_get("zookeeper").err().unwrap();
        assert_eq!(
            err,
            ComponentError::FactoryNotRegistered {
                kind: "registry",
                name: "zookeeper".to_string()
            }
        );
        assert_eq!(err.to_string(), "no registry factory registered under \"zookeeper\"");
    }

    #[test]
    #[should_panic(expected = "no registry factory registered under \"nope\"")]
    fn get_panics_for_missing_factory() {
        let table: FactoryTable<dyn RegistryFactory> = FactoryTable::new("registry");
        let _ = table.get("nope");
    }

    #[test]
    fn defaults_install_memory_backends_and_rpc_service() {
        install_defaults();
        install_defaults();

        assert!(try_get_registry_factory(MEMORY_KEY).is_ok());
        assert!(try_get_config_center_factory(MEMORY_KEY).is_ok());
        assert!(try_get_service_factory(DEFAULT_PROTOCOL).is_ok());
        assert!(server_wrapper(AUTH_WRAPPER).is_some());
    }

    #[test]
    fn wrapper_lookups_return_none_when_absent() {
        assert!(server_wrapper("never-registered").is_none());
        assert!(client_wrapper("never-registered").is_none());

        set_client_wrapper("component-test-token", Arc::new(BearerTokenWrapper::new("t")));
        assert!(client_wrapper("component-test-token").is_some());
    }
}
