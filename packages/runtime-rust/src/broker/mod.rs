//! Publish/subscribe abstraction.
//!
//! Publishing is fire-and-forget. Each subscription owns one receive task
//! that decodes payloads into [`Message`]s and invokes its [`Handler`]
//! sequentially; separate subscriptions run in parallel. Acknowledgement is
//! advisory and never triggers redelivery.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use xmicro_core::{Codec, CodecError, Message, Metadata};

pub use memory::MemoryBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not connected")]
    NotConnected,
    #[error("broker is connected; disconnect before re-initialising")]
    Connected,
    #[error("message codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("broker backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub addrs: Vec<String>,
    /// Wire codec for whole messages.
    pub codec: Codec,
    pub secure: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            codec: Codec::Json,
            secure: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Extra headers merged into the message before encoding.
    pub headers: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Call [`Publication::ack`] after the handler succeeds.
    pub auto_ack: bool,
    /// Subscribers sharing a queue name on a topic split its messages.
    pub queue: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            queue: None,
        }
    }
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A received message together with its topic.
pub trait Publication: Send + Sync {
    fn topic(&self) -> &str;

    fn message(&self) -> &Message;

    /// # Errors
    ///
    /// Backend-specific; advisory only.
    fn ack(&self) -> Result<(), BrokerError>;

    /// Delivery error attached by the backend, if any.
    fn error(&self) -> Option<&BrokerError>;
}

/// Consumer of publications for one subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, publication: &dyn Publication) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&dyn Publication) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, publication: &dyn Publication) -> anyhow::Result<()> {
        self(publication)
    }
}

/// Wraps a closure as a shareable [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&dyn Publication) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    fn topic(&self) -> &str;

    fn options(&self) -> &SubscribeOptions;

    /// Ends the subscription's receive loop. Idempotent.
    async fn unsubscribe(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns [`BrokerError::Connected`] while connected.
    fn init(&self, options: BrokerOptions) -> Result<(), BrokerError>;

    fn options(&self) -> BrokerOptions;

    fn address(&self) -> String;

    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, message: &Message, opts: PublishOptions) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        opts: SubscribeOptions,
    ) -> Result<Box<dyn Subscriber>, BrokerError>;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.name())
            .field("address", &self.address())
            .finish()
    }
}
