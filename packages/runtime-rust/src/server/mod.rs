//! RPC server contract.
//!
//! A server owns request handlers (routed by the `Handler` part of a
//! `Handler.Method` endpoint), broker subscribers, and its own registry
//! membership. Handler wrappers decorate the dispatch chain.

pub mod rpc;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use xmicro_core::constants::{
    DEFAULT_REGISTER_INTERVAL_SECS, DEFAULT_REGISTER_TTL_SECS, DEFAULT_SERVER_ADDRESS, DEFAULT_SERVER_NAME,
    DEFAULT_SERVER_VERSION,
};
use xmicro_core::{CodecError, Endpoint, Request, Response};

use crate::broker::{Broker, BrokerError, Handler, SubscribeOptions};
use crate::registry::{Registry, RegistryError};
use crate::transport::{Transport, TransportError};

pub use rpc::RpcServer;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("endpoint {0:?} is not of the form Handler.Method")]
    MalformedEndpoint(String),
    #[error("no handler registered for {0:?}")]
    UnknownHandler(String),
    #[error("handler {0:?} already registered")]
    DuplicateHandler(String),
    #[error("unknown method {method:?} on handler {handler:?}")]
    UnknownMethod { handler: String, method: String },
    #[error("missing or malformed bearer token")]
    Unauthorized,
    #[error("server already started")]
    AlreadyStarted,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
}

/// Serves every `Handler.Method` endpoint of one named handler.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// The `Handler` part of the endpoints it serves.
    fn name(&self) -> &str;

    /// Endpoints advertised in the registry.
    fn endpoints(&self) -> Vec<Endpoint> {
        Vec::new()
    }

    async fn serve(&self, request: Request) -> Result<Response, ServerError>;
}

/// Decorates the dispatch chain. Wrappers registered first run outermost.
pub trait HandlerWrapper: Send + Sync {
    fn wrap(&self, inner: Arc<dyn RequestHandler>) -> Arc<dyn RequestHandler>;
}

/// A broker subscription owned by a server; bound when the server starts.
#[derive(Clone)]
pub struct ServerSubscriber {
    pub topic: String,
    pub handler: Arc<dyn Handler>,
    pub options: SubscribeOptions,
}

impl fmt::Debug for ServerSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSubscriber")
            .field("topic", &self.topic)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ServerOptions {
    pub name: String,
    pub version: String,
    /// Unique per process; node ids are `{name}-{id}`.
    pub id: String,
    /// Listen address; port `0` picks one.
    pub address: String,
    /// Address published in the registry instead of the bound one.
    pub advertise: Option<String>,
    pub metadata: HashMap<String, String>,
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<dyn Registry>,
    pub transport: Arc<dyn Transport>,
    pub register_ttl: Duration,
    /// Re-registration period; zero disables it.
    pub register_interval: Duration,
    pub wrappers: Vec<Arc<dyn HandlerWrapper>>,
}

impl ServerOptions {
    /// Options with default name, version, address and registration timing.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<dyn Registry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            version: DEFAULT_SERVER_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            advertise: None,
            metadata: HashMap::new(),
            broker,
            registry,
            transport,
            register_ttl: Duration::from_secs(DEFAULT_REGISTER_TTL_SECS),
            register_interval: Duration::from_secs(DEFAULT_REGISTER_INTERVAL_SECS),
            wrappers: Vec::new(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("id", &self.id)
            .field("address", &self.address)
            .field("advertise", &self.advertise)
            .field("metadata", &self.metadata)
            .field("broker", &self.broker.name())
            .field("registry", &self.registry.name())
            .field("transport", &self.transport.name())
            .field("register_ttl", &self.register_ttl)
            .field("register_interval", &self.register_interval)
            .field("wrappers", &self.wrappers.len())
            .finish()
    }
}

#[async_trait]
pub trait Server: Send + Sync {
    fn name(&self) -> &'static str;

    fn options(&self) -> ServerOptions;

    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] while running.
    fn init(&self, options: ServerOptions) -> Result<(), ServerError>;

    /// # Errors
    ///
    /// Returns [`ServerError::DuplicateHandler`] if the name is taken.
    fn handle(&self, handler: Arc<dyn RequestHandler>) -> Result<(), ServerError>;

    fn new_subscriber(&self, topic: &str, handler: Arc<dyn Handler>, options: SubscribeOptions) -> ServerSubscriber {
        ServerSubscriber {
            topic: topic.to_string(),
            handler,
            options,
        }
    }

    /// Adds a subscriber; bound immediately when running, otherwise on start.
    async fn subscribe(&self, subscriber: ServerSubscriber) -> Result<(), ServerError>;

    /// Address registered for this node, once started.
    fn address(&self) -> Option<String>;

    async fn start(&self) -> Result<(), ServerError>;

    async fn stop(&self) -> Result<(), ServerError>;
}

impl fmt::Debug for dyn Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name())
            .field("address", &self.address())
            .finish()
    }
}
