//! `xmicro` core — registry model, broker messages, backend URLs, codecs,
//! and RPC envelopes shared by every framework component.

pub mod change;
pub mod codec;
pub mod constants;
pub mod envelope;
pub mod message;
pub mod registry;
pub mod url;

pub use change::{ChangeEvent, EventType};
pub use codec::{Codec, CodecError};
pub use envelope::{Metadata, Request, Response};
pub use message::Message;
pub use registry::{Endpoint, EventAction, Node, RegistryEvent, Service, Value};
pub use url::{Url, UrlError};
