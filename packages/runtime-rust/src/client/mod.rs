//! RPC client contract.

pub mod rpc;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use xmicro_core::message::CONTENT_TYPE_HEADER;
use xmicro_core::{Codec, CodecError, Message, Request, Response};

use crate::broker::{Broker, BrokerError};
use crate::registry::{Registry, RegistryError};
use crate::selector::{RandomSelector, Selector, SelectorError};
use crate::transport::{Transport, TransportError};

pub use rpc::RpcClient;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on resolving a service to routes before the send.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("resolving {service} timed out after {timeout:?}")]
    ConnectTimeout { service: String, timeout: Duration },
    #[error("call to {service}/{endpoint} timed out after {timeout:?}")]
    Timeout {
        service: String,
        endpoint: String,
        timeout: Duration,
    },
}

/// Everything a client needs to resolve, pick and reach a node.
#[derive(Clone)]
pub struct ClientOptions {
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<dyn Registry>,
    pub transport: Arc<dyn Transport>,
    pub selector: Arc<dyn Selector>,
    /// Codec used for request bodies built by the client.
    pub codec: Codec,
    /// Bounds the registry lookup that precedes each send.
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientOptions {
    /// Options with the random selector, JSON bodies and the default timeout.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<dyn Registry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            broker,
            registry,
            transport,
            selector: Arc::new(RandomSelector::new()),
            codec: Codec::Json,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("broker", &self.broker.name())
            .field("registry", &self.registry.name())
            .field("transport", &self.transport.name())
            .field("selector", &self.selector.name())
            .field("codec", &self.codec)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[async_trait]
pub trait Client: Send + Sync {
    fn name(&self) -> &'static str;

    fn options(&self) -> ClientOptions;

    fn init(&self, options: ClientOptions);

    /// Sends `request` to one node of `request.service`.
    async fn call(&self, request: Request) -> Result<Response, ClientError>;

    async fn publish(&self, topic: &str, message: Message) -> Result<(), ClientError>;
}

impl fmt::Debug for dyn Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("name", &self.name()).finish()
    }
}

/// Decorates a client, e.g. to inject request metadata.
pub trait ClientWrapper: Send + Sync {
    fn wrap(&self, client: Arc<dyn Client>) -> Arc<dyn Client>;
}

/// Builds a broker message whose body is `payload` encoded with `codec`.
///
/// # Errors
///
/// Returns a [`CodecError`] if the payload cannot be encoded.
pub fn new_message<T: serde::Serialize + ?Sized>(codec: Codec, payload: &T) -> Result<Message, CodecError> {
    Ok(Message::new(codec.marshal(payload)?).with_header(CONTENT_TYPE_HEADER, codec.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_records_content_type() {
        let msg = new_message(Codec::MsgPack, &[1u8, 2, 3]).unwrap();
        assert_eq!(msg.content_type(), Some("application/msgpack"));
        let decoded: Vec<u8> = Codec::MsgPack.unmarshal(&msg.body).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }
}
