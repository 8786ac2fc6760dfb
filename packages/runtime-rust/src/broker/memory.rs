//! In-process [`Broker`]. Messages are encoded with the configured codec on
//! publish and decoded again by each subscription's receive loop, so the
//! decode path behaves like a real wire backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xmicro_core::constants::MEMORY_KEY;
use xmicro_core::{Codec, Message};

use super::{
    Broker, BrokerError, BrokerOptions, Handler, PublishOptions, Publication, SubscribeOptions, Subscriber,
};

struct Slot {
    id: u64,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

type Topics = Arc<DashMap<String, Vec<Slot>>>;

pub struct MemoryBroker {
    options: RwLock<BrokerOptions>,
    connected: AtomicBool,
    topics: Topics,
    /// Round-robin position per `(topic, queue)`.
    cursors: DashMap<(String, String), usize>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(BrokerOptions::default())
    }

    #[must_use]
    pub fn with_options(options: BrokerOptions) -> Self {
        Self {
            options: RwLock::new(options),
            connected: AtomicBool::new(false),
            topics: Arc::new(DashMap::new()),
            cursors: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Delivers an already-encoded payload to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] before [`Broker::connect`].
    pub fn publish_raw(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let Some(mut slots) = self.topics.get_mut(topic) else {
            debug!(topic, "publish with no subscribers");
            return Ok(());
        };
        slots.retain(|slot| !slot.tx.is_closed());

        let mut groups: BTreeMap<&str, Vec<&Slot>> = BTreeMap::new();
        for slot in slots.iter() {
            match &slot.queue {
                None => {
                    let _ = slot.tx.send(payload.to_vec());
                }
                Some(queue) => groups.entry(queue.as_str()).or_default().push(slot),
            }
        }
        for (queue, members) in groups {
            let mut cursor = self
                .cursors
                .entry((topic.to_string(), queue.to_string()))
                .or_insert(0);
            let slot = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let _ = slot.tx.send(payload.to_vec());
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        MEMORY_KEY
    }

    fn init(&self, options: BrokerOptions) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Err(BrokerError::Connected);
        }
        *self.options.write() = options;
        Ok(())
    }

    fn options(&self) -> BrokerOptions {
        self.options.read().clone()
    }

    fn address(&self) -> String {
        let options = self.options.read();
        if options.addrs.is_empty() {
            MEMORY_KEY.to_string()
        } else {
            options.addrs.join(",")
        }
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!(address = %self.address(), "memory broker connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if self.connected.swap(false, Ordering::AcqRel) {
            // Dropping every sender ends every receive loop.
            self.topics.clear();
            self.cursors.clear();
            info!("memory broker disconnected");
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &Message, opts: PublishOptions) -> Result<(), BrokerError> {
        let codec = self.options.read().codec;
        let payload = if opts.headers.is_empty() {
            codec.marshal(message)?
        } else {
            let mut message = message.clone();
            message.header.extend(opts.headers);
            codec.marshal(&message)?
        };
        self.publish_raw(topic, &payload)
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        opts: SubscribeOptions,
    ) -> Result<Box<dyn Subscriber>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(topic.to_string()).or_default().push(Slot {
            id,
            queue: opts.queue.clone(),
            tx,
        });

        let codec = self.options.read().codec;
        tokio::spawn(receive_loop(topic.to_string(), codec, rx, handler, opts.auto_ack));
        debug!(topic, id, queue = ?opts.queue, "subscribed");

        Ok(Box::new(MemorySubscriber {
            id,
            topic: topic.to_string(),
            options: opts,
            topics: Arc::clone(&self.topics),
            closed: AtomicBool::new(false),
        }))
    }
}

async fn receive_loop(
    topic: String,
    codec: Codec,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handler: Arc<dyn Handler>,
    auto_ack: bool,
) {
    while let Some(payload) = rx.recv().await {
        let message: Message = match codec.unmarshal(&payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(%topic, error = %err, "dropping undecodable broker payload");
                continue;
            }
        };
        let publication = MemoryPublication {
            topic: topic.clone(),
            message,
        };
        if let Err(err) = handler.handle(&publication).await {
            warn!(%topic, error = %err, "subscription handler failed");
            continue;
        }
        if auto_ack {
            if let Err(err) = publication.ack() {
                warn!(%topic, error = %err, "ack failed");
            }
        }
    }
    debug!(%topic, "subscription receive loop ended");
}

struct MemoryPublication {
    topic: String,
    message: Message,
}

impl Publication for MemoryPublication {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn message(&self) -> &Message {
        &self.message
    }

    fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn error(&self) -> Option<&BrokerError> {
        None
    }
}

struct MemorySubscriber {
    id: u64,
    topic: String,
    options: SubscribeOptions,
    topics: Topics,
    closed: AtomicBool,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut slots) = self.topics.get_mut(&self.topic) {
            slots.retain(|slot| slot.id != self.id);
        }
        debug!(topic = %self.topic, id = self.id, "unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::handler_fn;

    type Received = mpsc::UnboundedReceiver<(String, Message)>;

    fn recording_handler() -> (Arc<dyn Handler>, Received) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |p: &dyn Publication| {
            let _ = tx.send((p.topic().to_string(), p.message().clone()));
            Ok(())
        });
        (handler, rx)
    }

    async fn recv(rx: &mut Received) -> Option<(String, Message)> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.ok().flatten()
    }

    async fn nothing(rx: &mut Received) -> bool {
        tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err()
    }

    async fn connected() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn published_message_reaches_handler_exactly_once() {
        let broker = connected().await;
        let (handler, mut rx) = recording_handler();
        let _sub = broker.subscribe("orders", handler, SubscribeOptions::default()).await.unwrap();

        let msg = Message::new(b"hello".to_vec()).with_header("k", "v");
        broker.publish("orders", &msg, PublishOptions::default()).await.unwrap();

        let (topic, got) = recv(&mut rx).await.unwrap();
        assert_eq!(topic, "orders");
        assert_eq!(got, msg);
        assert!(nothing(&mut rx).await);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped_and_loop_survives() {
        let broker = connected().await;
        let (handler, mut rx) = recording_handler();
        let _sub = broker.subscribe("t", handler, SubscribeOptions::default()).await.unwrap();

        broker.publish_raw("t", b"{not json").unwrap();
        let msg = Message::new(b"ok".to_vec());
        broker.publish("t", &msg, PublishOptions::default()).await.unwrap();

        let (_, got) = recv(&mut rx).await.unwrap();
        assert_eq!(got, msg);
        assert!(nothing(&mut rx).await);
    }

    #[tokio::test]
    async fn failing_handler_does_not_end_subscription() {
        let broker = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handler = handler_fn(move |p: &dyn Publication| {
            let _ = tx.send(p.message().body.clone());
            anyhow::bail!("handler refused")
        });
        let _sub = broker.subscribe("t", handler, SubscribeOptions::default()).await.unwrap();

        for body in [b"1", b"2"] {
            broker.publish("t", &Message::new(body.to_vec()), PublishOptions::default()).await.unwrap();
        }
        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        assert_eq!(first, Some(b"1".to_vec()));
        assert_eq!(second, Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn publish_headers_are_merged() {
        let broker = connected().await;
        let (handler, mut rx) = recording_handler();
        let _sub = broker.subscribe("t", handler, SubscribeOptions::default()).await.unwrap();

        let mut opts = PublishOptions::default();
        opts.headers.insert("trace".to_string(), "abc".to_string());
        broker.publish("t", &Message::new(Vec::new()), opts).await.unwrap();

        let (_, got) = recv(&mut rx).await.unwrap();
        assert_eq!(got.header.get("trace").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn queue_group_splits_messages_between_members() {
        let broker = connected().await;
        let (h1, mut rx1) = recording_handler();
        let (h2, mut rx2) = recording_handler();
        let opts = SubscribeOptions::default().with_queue("workers");
        let _a = broker.subscribe("jobs", h1, opts.clone()).await.unwrap();
        let _b = broker.subscribe("jobs", h2, opts).await.unwrap();

        for i in 0..4u8 {
            broker.publish("jobs", &Message::new(vec![i]), PublishOptions::default()).await.unwrap();
        }

        let mut counts = [0usize; 2];
        for (i, rx) in [&mut rx1, &mut rx2].into_iter().enumerate() {
            while tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .ok()
                .flatten()
                .is_some()
            {
                counts[i] += 1;
            }
        }
        assert_eq!(counts, [2, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_is_idempotent() {
        let broker = connected().await;
        let (handler, mut rx) = recording_handler();
        let sub = broker.subscribe("t", handler, SubscribeOptions::default()).await.unwrap();

        sub.unsubscribe().await.unwrap();
        sub.unsubscribe().await.unwrap();
        broker.publish("t", &Message::new(b"x".to_vec()), PublishOptions::default()).await.unwrap();

        // Loop ended: the sender side is gone, so the channel closes.
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn init_is_refused_while_connected() {
        let broker = connected().await;
        assert!(matches!(broker.init(BrokerOptions::default()), Err(BrokerError::Connected)));

        broker.disconnect().await.unwrap();
        assert!(broker.init(BrokerOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let broker = MemoryBroker::new();
        let (handler, _rx) = recording_handler();
        assert!(matches!(
            broker.publish("t", &Message::default(), PublishOptions::default()).await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(
            broker.subscribe("t", handler, SubscribeOptions::default()).await,
            Err(BrokerError::NotConnected)
        ));
    }
}
