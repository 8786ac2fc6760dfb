//! Request/response transport between client and server.
//!
//! Only the interface and an in-process adapter live here; network
//! transports plug in behind [`Transport`].

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use xmicro_core::{Request, Response};

pub use memory::MemoryTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no listener at {0}")]
    Unreachable(String),
    #[error("address {0} already in use")]
    AddressInUse(String),
    #[error("invalid address {0:?}, expected host:port")]
    InvalidAddress(String),
    #[error("no free ephemeral port on {0}")]
    PortsExhausted(String),
    /// The remote handler failed; carries its message.
    #[error("remote error: {0}")]
    Remote(String),
    #[error("transport backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Server side of a transport: answers one request.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn serve(&self, request: Request) -> anyhow::Result<Response>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    /// Bound address, with any `:0` port resolved.
    fn address(&self) -> &str;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn listen(
        &self,
        address: &str,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Box<dyn Listener>, TransportError>;

    async fn send(&self, address: &str, request: Request) -> Result<Response, TransportError>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("name", &self.name()).finish()
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
///
/// # Errors
///
/// Returns [`TransportError::InvalidAddress`] when the port is missing or not a `u16`.
pub fn split_host_port(address: &str) -> Result<(&str, u16), TransportError> {
    let invalid = || TransportError::InvalidAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("127.0.0.1:8080").unwrap(), ("127.0.0.1", 8080));
        assert_eq!(split_host_port("[::1]:9000").unwrap(), ("::1", 9000));
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["localhost", "host:", ":80", "host:99999"] {
            assert!(
                matches!(split_host_port(bad), Err(TransportError::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
    }
}
