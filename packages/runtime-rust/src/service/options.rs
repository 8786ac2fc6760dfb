//! Service options and the option functions that build them.
//!
//! Options are applied in order onto one snapshot: scalar fields are
//! last-writer-wins, hooks append. Setting the broker, registry or transport
//! also pushes it into the client and server so every component sees the
//! same backends.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use xmicro_core::constants::MEMORY_KEY;
use xmicro_core::Url;

use crate::broker::{Broker, MemoryBroker};
use crate::client::{Client, ClientOptions, ClientWrapper, RpcClient};
use crate::component::{get_registry_factory, install_defaults};
use crate::registry::{MemoryRegistry, Registry};
use crate::selector::Selector;
use crate::server::{HandlerWrapper, RpcServer, Server, ServerOptions};
use crate::transport::{MemoryTransport, Transport};
use crate::BoxFuture;

/// Lifecycle hook. Hooks are re-runnable: each call produces a new future.
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One builder step applied to a [`ServiceOptions`] snapshot.
pub type ServiceOption = Box<dyn FnOnce(&mut ServiceOptions) + Send>;

/// Wraps an async closure as a [`Hook`].
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Clone)]
pub struct ServiceOptions {
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<dyn Registry>,
    pub transport: Arc<dyn Transport>,
    pub client: Arc<dyn Client>,
    pub server: Arc<dyn Server>,
    /// `run` blocks until this token is cancelled.
    pub context: CancellationToken,
    /// Also stop `run` on Ctrl-C.
    pub signal: bool,
    pub before_start: Vec<Hook>,
    pub after_start: Vec<Hook>,
    pub before_stop: Vec<Hook>,
    pub after_stop: Vec<Hook>,
}

impl ServiceOptions {
    /// Defaults: a private memory broker, the process-wide memory registry
    /// and transport, and the rpc client and server over them.
    #[must_use]
    pub fn new() -> Self {
        install_defaults();
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let registry = get_registry_factory(MEMORY_KEY)
            .get_registry(&Url::new(MEMORY_KEY, ""))
            .unwrap_or_else(|err| {
                warn!(error = %err, "shared memory registry unavailable; using a private one");
                Arc::new(MemoryRegistry::new()) as Arc<dyn Registry>
            });
        let transport: Arc<dyn Transport> = MemoryTransport::global();

        let client = Arc::new(RpcClient::new(ClientOptions::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            Arc::clone(&transport),
        )));
        let server = Arc::new(RpcServer::new(ServerOptions::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            Arc::clone(&transport),
        )));

        Self {
            broker,
            registry,
            transport,
            client,
            server,
            context: CancellationToken::new(),
            signal: true,
            before_start: Vec::new(),
            after_start: Vec::new(),
            before_stop: Vec::new(),
            after_stop: Vec::new(),
        }
    }

    /// Defaults with `opts` applied in order.
    #[must_use]
    pub fn with(opts: impl IntoIterator<Item = ServiceOption>) -> Self {
        let mut options = Self::new();
        options.apply(opts);
        options
    }

    pub fn apply(&mut self, opts: impl IntoIterator<Item = ServiceOption>) {
        for opt in opts {
            opt(self);
        }
    }

    fn update_client(&self, f: impl FnOnce(&mut ClientOptions)) {
        let mut opts = self.client.options();
        f(&mut opts);
        self.client.init(opts);
    }

    fn update_server(&self, f: impl FnOnce(&mut ServerOptions)) {
        let mut opts = self.server.options();
        f(&mut opts);
        if let Err(err) = self.server.init(opts) {
            warn!(error = %err, "server options not applied");
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("broker", &self.broker.name())
            .field("registry", &self.registry.name())
            .field("transport", &self.transport.name())
            .field("client", &self.client.name())
            .field("server", &self.server.name())
            .field("signal", &self.signal)
            .field("before_start", &self.before_start.len())
            .field("after_start", &self.after_start.len())
            .field("before_stop", &self.before_stop.len())
            .field("after_stop", &self.after_stop.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Option functions
// ---------------------------------------------------------------------------

/// Registry name of the service.
pub fn name(name: impl Into<String>) -> ServiceOption {
    let name = name.into();
    Box::new(move |o| o.update_server(|s| s.name = name))
}

pub fn version(version: impl Into<String>) -> ServiceOption {
    let version = version.into();
    Box::new(move |o| o.update_server(|s| s.version = version))
}

/// Server listen address.
pub fn address(address: impl Into<String>) -> ServiceOption {
    let address = address.into();
    Box::new(move |o| o.update_server(|s| s.address = address))
}

pub fn advertise(address: impl Into<String>) -> ServiceOption {
    let address = address.into();
    Box::new(move |o| o.update_server(|s| s.advertise = Some(address)))
}

/// Merges `metadata` into the server metadata.
pub fn metadata(metadata: HashMap<String, String>) -> ServiceOption {
    Box::new(move |o| o.update_server(|s| s.metadata.extend(metadata)))
}

pub fn register_ttl(ttl: Duration) -> ServiceOption {
    Box::new(move |o| o.update_server(|s| s.register_ttl = ttl))
}

pub fn register_interval(interval: Duration) -> ServiceOption {
    Box::new(move |o| o.update_server(|s| s.register_interval = interval))
}

pub fn broker(broker: Arc<dyn Broker>) -> ServiceOption {
    Box::new(move |o| {
        o.update_client(|c| c.broker = Arc::clone(&broker));
        o.update_server(|s| s.broker = Arc::clone(&broker));
        o.broker = broker;
    })
}

pub fn registry(registry: Arc<dyn Registry>) -> ServiceOption {
    Box::new(move |o| {
        o.update_client(|c| c.registry = Arc::clone(&registry));
        o.update_server(|s| s.registry = Arc::clone(&registry));
        o.registry = registry;
    })
}

pub fn transport(transport: Arc<dyn Transport>) -> ServiceOption {
    Box::new(move |o| {
        o.update_client(|c| c.transport = Arc::clone(&transport));
        o.update_server(|s| s.transport = Arc::clone(&transport));
        o.transport = transport;
    })
}

pub fn selector(selector: Arc<dyn Selector>) -> ServiceOption {
    Box::new(move |o| o.update_client(|c| c.selector = selector))
}

/// Bounds the registry lookup before each call.
pub fn connect_timeout(timeout: Duration) -> ServiceOption {
    Box::new(move |o| o.update_client(|c| c.connect_timeout = timeout))
}

pub fn request_timeout(timeout: Duration) -> ServiceOption {
    Box::new(move |o| o.update_client(|c| c.request_timeout = timeout))
}

/// Replaces the client. Later broker/registry/transport options are pushed
/// into it; earlier ones are not.
pub fn client(client: Arc<dyn Client>) -> ServiceOption {
    Box::new(move |o| o.client = client)
}

/// Replaces the server. Later broker/registry/transport options are pushed
/// into it; earlier ones are not.
pub fn server(server: Arc<dyn Server>) -> ServiceOption {
    Box::new(move |o| o.server = server)
}

/// Decorates the current client.
pub fn wrap_client(wrapper: Arc<dyn ClientWrapper>) -> ServiceOption {
    Box::new(move |o| o.client = wrapper.wrap(Arc::clone(&o.client)))
}

/// Appends a handler wrapper; wrappers apply in registration order.
pub fn wrap_handler(wrapper: Arc<dyn HandlerWrapper>) -> ServiceOption {
    Box::new(move |o| o.update_server(|s| s.wrappers.push(wrapper)))
}

pub fn context(token: CancellationToken) -> ServiceOption {
    Box::new(move |o| o.context = token)
}

pub fn handle_signal(enabled: bool) -> ServiceOption {
    Box::new(move |o| o.signal = enabled)
}

pub fn before_start(hook: Hook) -> ServiceOption {
    Box::new(move |o| o.before_start.push(hook))
}

pub fn after_start(hook: Hook) -> ServiceOption {
    Box::new(move |o| o.after_start.push(hook))
}

pub fn before_stop(hook: Hook) -> ServiceOption {
    Box::new(move |o| o.before_stop.push(hook))
}

pub fn after_stop(hook: Hook) -> ServiceOption {
    Box::new(move |o| o.after_stop.push(hook))
}
