//! In-process transport: listeners are entries in a shared address table and
//! `send` invokes the handler directly.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use xmicro_core::constants::MEMORY_KEY;
use xmicro_core::{Request, Response};

use super::{split_host_port, Listener, Transport, TransportError, TransportHandler};

const EPHEMERAL_PORTS: RangeInclusive<u16> = 20_000..=u16::MAX;

type Table = Arc<DashMap<String, Arc<dyn TransportHandler>>>;

pub struct MemoryTransport {
    listeners: Table,
    ephemeral: RangeInclusive<u16>,
    cursor: AtomicU32,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ephemeral_ports(EPHEMERAL_PORTS)
    }

    /// Transport handing out `host:0` binds from `ports`. Port 0 is never used.
    #[must_use]
    pub fn with_ephemeral_ports(ports: RangeInclusive<u16>) -> Self {
        let start = (*ports.start()).max(1);
        Self {
            listeners: Arc::new(DashMap::new()),
            ephemeral: start..=(*ports.end()).max(start),
            cursor: AtomicU32::new(0),
        }
    }

    /// Process-wide instance, so independently built clients and servers
    /// can reach each other.
    #[must_use]
    pub fn global() -> Arc<MemoryTransport> {
        static GLOBAL: OnceLock<Arc<MemoryTransport>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MemoryTransport::new())))
    }

    fn ephemeral_span(&self) -> u32 {
        u32::from(*self.ephemeral.end() - *self.ephemeral.start()) + 1
    }

    fn ephemeral_port(&self) -> u16 {
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % self.ephemeral_span();
        // offset < span <= 65535, so it always fits.
        *self.ephemeral.start() + u16::try_from(offset).unwrap_or_default()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        MEMORY_KEY
    }

    async fn listen(
        &self,
        address: &str,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let (host, port) = split_host_port(address)?;
        let ephemeral = port == 0;
        let attempts = if ephemeral { self.ephemeral_span() } else { 1 };

        for _ in 0..attempts {
            let port = if ephemeral { self.ephemeral_port() } else { port };
            let bound = if host.contains(':') {
                format!("[{host}]:{port}")
            } else {
                format!("{host}:{port}")
            };
            match self.listeners.entry(bound.clone()) {
                Entry::Occupied(_) if ephemeral => {}
                Entry::Occupied(_) => return Err(TransportError::AddressInUse(bound)),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&handler));
                    debug!(address = %bound, "memory transport listening");
                    return Ok(Box::new(MemoryListener {
                        address: bound,
                        listeners: Arc::clone(&self.listeners),
                    }));
                }
            }
        }
        Err(TransportError::PortsExhausted(host.to_string()))
    }

    async fn send(&self, address: &str, request: Request) -> Result<Response, TransportError> {
        let handler = self
            .listeners
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::Unreachable(address.to_string()))?;
        handler
            .serve(request)
            .await
            .map_err(|err| TransportError::Remote(format!("{err:#}")))
    }
}

struct MemoryListener {
    address: String,
    listeners: Table,
}

#[async_trait]
impl Listener for MemoryListener {
    fn address(&self) -> &str {
        &self.address
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.listeners.remove(&self.address).is_some() {
            debug!(address = %self.address, "memory transport listener closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use xmicro_core::Codec;

    use super::*;

    struct Echo;

    #[async_trait]
    impl TransportHandler for Echo {
        async fn serve(&self, request: Request) -> anyhow::Result<Response> {
            Ok(Response {
                codec: request.codec,
                body: request.body,
                metadata: request.metadata,
            })
        }
    }

    struct Fails;

    #[async_trait]
    impl TransportHandler for Fails {
        async fn serve(&self, _request: Request) -> anyhow::Result<Response> {
            anyhow::bail!("boom")
        }
    }

    fn request() -> Request {
        Request::encode("svc", "Echo.Call", Codec::Json, &"hi").unwrap()
    }

    #[tokio::test]
    async fn send_reaches_listener_and_returns_response() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("127.0.0.1:7000", Arc::new(Echo)).await.unwrap();
        assert_eq!(listener.address(), "127.0.0.1:7000");

        let rsp = transport.send("127.0.0.1:7000", request()).await.unwrap();
        assert_eq!(rsp.decode::<String>().unwrap(), "hi");
    }

    #[tokio::test]
    async fn port_zero_gets_distinct_addresses() {
        let transport = MemoryTransport::new();
        let a = transport.listen("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        let b = transport.listen("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        assert_ne!(a.address(), b.address());
        assert!(!a.address().ends_with(":0"));
    }

    #[tokio::test]
    async fn ephemeral_search_gives_up_when_every_port_is_taken() {
        let transport = MemoryTransport::with_ephemeral_ports(30_000..=30_002);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(transport.listen("h:0", Arc::new(Echo)).await.unwrap());
        }

        assert!(matches!(
            transport.listen("h:0", Arc::new(Echo)).await,
            Err(TransportError::PortsExhausted(host)) if host == "h"
        ));

        held.pop().unwrap().close().await.unwrap();
        let reused = transport.listen("h:0", Arc::new(Echo)).await.unwrap();
        assert_eq!(reused.address(), "h:30002");
    }

    #[tokio::test]
    async fn fixed_address_cannot_be_bound_twice() {
        let transport = MemoryTransport::new();
        let _first = transport.listen("h:1", Arc::new(Echo)).await.unwrap();
        assert!(matches!(
            transport.listen("h:1", Arc::new(Echo)).await,
            Err(TransportError::AddressInUse(addr)) if addr == "h:1"
        ));
    }

    #[tokio::test]
    async fn closed_listener_is_unreachable() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("h:2", Arc::new(Echo)).await.unwrap();
        listener.close().await.unwrap();

        assert!(matches!(
            transport.send("h:2", request()).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn handler_failure_is_remote_error() {
        let transport = MemoryTransport::new();
        let _l = transport.listen("h:3", Arc::new(Fails)).await.unwrap();
        let err = transport.send("h:3", request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(msg) if msg == "boom"));
    }
}
