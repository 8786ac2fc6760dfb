//! In-process [`Registry`] backend.
//!
//! Services are grouped `domain -> name -> version -> nodes`. Node TTLs are
//! enforced lazily: expired nodes are purged (and `Delete` events emitted)
//! on the next read.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use xmicro_core::constants::REGISTRY_TIMEOUT_KEY;
use xmicro_core::{Endpoint, EventAction, Node, RegistryEvent, Service, Url};

use super::{
    domain_or_default, validate_nodes, DeregisterOptions, GetOptions, ListOptions, RegisterOptions,
    Registry, RegistryError, RegistryFactory, RegistryOptions, RegistryState, WatchOptions, Watcher,
    WILDCARD_DOMAIN,
};
use crate::configuration::parse_duration;

struct NodeRecord {
    node: Node,
    expires_at: Option<Instant>,
}

impl NodeRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct VersionRecord {
    metadata: HashMap<String, String>,
    endpoints: Vec<Endpoint>,
    /// Registration order is preserved.
    nodes: Vec<NodeRecord>,
}

impl VersionRecord {
    fn to_service(&self, name: &str, version: &str) -> Service {
        Service {
            name: name.to_string(),
            version: version.to_string(),
            metadata: self.metadata.clone(),
            endpoints: self.endpoints.clone(),
            nodes: self.nodes.iter().map(|r| r.node.clone()).collect(),
        }
    }
}

type Versions = HashMap<String, VersionRecord>;
type Names = HashMap<String, Versions>;

struct WatcherSlot {
    service: Option<String>,
    domain: String,
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl WatcherSlot {
    fn matches(&self, domain: &str, service: &str) -> bool {
        (self.domain == WILDCARD_DOMAIN || self.domain == domain)
            && self.service.as_deref().is_none_or(|s| s == service)
    }
}

fn domain_matches(requested: Option<&str>, domain: &str) -> bool {
    let requested = domain_or_default(requested);
    requested == WILDCARD_DOMAIN || requested == domain
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// In-memory registry shared by everything in one process.
pub struct MemoryRegistry {
    options: RwLock<RegistryOptions>,
    state: ArcSwap<RegistryState>,
    domains: RwLock<HashMap<String, Names>>,
    watchers: Arc<DashMap<u64, WatcherSlot>>,
    next_watcher_id: AtomicU64,
}

impl MemoryRegistry {
    /// Creates a configured registry with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(RegistryOptions::default())
    }

    #[must_use]
    pub fn with_options(options: RegistryOptions) -> Self {
        Self {
            options: RwLock::new(options),
            state: ArcSwap::from_pointee(RegistryState::Configured),
            domains: RwLock::new(HashMap::new()),
            watchers: Arc::new(DashMap::new()),
            next_watcher_id: AtomicU64::new(1),
        }
    }

    /// Number of live watchers.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Lazily opens the session; fails once closed.
    fn ensure_open(&self) -> Result<(), RegistryError> {
        let previous = self.state.rcu(|current| {
            if **current == RegistryState::Closed {
                Arc::clone(current)
            } else {
                Arc::new(RegistryState::Connected)
            }
        });
        if *previous == RegistryState::Closed {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    fn notify(&self, domain: &str, action: EventAction, service: Service) {
        let event = RegistryEvent {
            id: Uuid::new_v4().to_string(),
            action,
            service,
            timestamp: now_millis(),
        };
        // Slots whose receiver is gone are dropped.
        self.watchers.retain(|_, slot| {
            if !slot.matches(domain, &event.service.name) {
                return true;
            }
            slot.tx.send(event.clone()).is_ok()
        });
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        let mut expired: Vec<(String, Service)> = Vec::new();
        {
            let mut domains = self.domains.write();
            for (domain, names) in domains.iter_mut() {
                for (name, versions) in names.iter_mut() {
                    for (version, record) in versions.iter_mut() {
                        let (gone, live): (Vec<_>, Vec<_>) = std::mem::take(&mut record.nodes)
                            .into_iter()
                            .partition(|r| r.is_expired(now));
                        record.nodes = live;
                        if !gone.is_empty() {
                            let mut svc = Service::new(name.clone(), version.clone());
                            svc.nodes = gone.into_iter().map(|r| r.node).collect();
                            expired.push((domain.clone(), svc));
                        }
                    }
                    versions.retain(|_, r| !r.nodes.is_empty());
                }
                names.retain(|_, v| !v.is_empty());
            }
        }
        for (domain, svc) in expired {
            debug!(service = %svc.name, nodes = svc.nodes.len(), "registry nodes expired");
            self.notify(&domain, EventAction::Delete, svc);
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn init(&self, options: RegistryOptions) -> Result<(), RegistryError> {
        let mut options_slot = self.options.write();
        // An open session survives re-init; only `Unconfigured` advances.
        let previous = self.state.rcu(|current| match **current {
            RegistryState::Unconfigured => Arc::new(RegistryState::Configured),
            _ => Arc::clone(current),
        });
        if *previous == RegistryState::Closed {
            return Err(RegistryError::Closed);
        }
        *options_slot = options;
        Ok(())
    }

    fn options(&self) -> RegistryOptions {
        self.options.read().clone()
    }

    fn state(&self) -> RegistryState {
        **self.state.load()
    }

    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<(), RegistryError> {
        validate_nodes(service)?;
        self.ensure_open()?;

        let domain = domain_or_default(opts.domain.as_deref()).to_string();
        let expires_at = opts.ttl.map(|ttl| Instant::now() + ttl);

        let action = {
            let mut domains = self.domains.write();
            let record = domains
                .entry(domain.clone())
                .or_default()
                .entry(service.name.clone())
                .or_default()
                .entry(service.version.clone())
                .or_default();
            record.metadata.clone_from(&service.metadata);
            record.endpoints.clone_from(&service.endpoints);

            let mut action = EventAction::Update;
            for node in &service.nodes {
                let entry = NodeRecord {
                    node: node.clone(),
                    expires_at,
                };
                match record.nodes.iter_mut().find(|r| r.node.id == node.id) {
                    Some(existing) => *existing = entry,
                    None => {
                        record.nodes.push(entry);
                        action = EventAction::Create;
                    }
                }
            }
            action
        };

        debug!(service = %service.name, version = %service.version, %domain, ?action, "registered nodes");
        self.notify(&domain, action, service.clone());
        Ok(())
    }

    async fn deregister(&self, service: &Service, opts: DeregisterOptions) -> Result<(), RegistryError> {
        validate_nodes(service)?;
        self.ensure_open()?;

        let domain = domain_or_default(opts.domain.as_deref()).to_string();
        {
            let mut domains = self.domains.write();
            if let Some(names) = domains.get_mut(&domain) {
                if let Some(versions) = names.get_mut(&service.name) {
                    if let Some(record) = versions.get_mut(&service.version) {
                        record
                            .nodes
                            .retain(|r| !service.nodes.iter().any(|n| n.id == r.node.id));
                        if record.nodes.is_empty() {
                            versions.remove(&service.version);
                        }
                    }
                    if versions.is_empty() {
                        names.remove(&service.name);
                    }
                }
            }
        }

        debug!(service = %service.name, version = %service.version, %domain, "deregistered nodes");
        self.notify(&domain, EventAction::Delete, service.clone());
        Ok(())
    }

    async fn get_service(&self, name: &str, opts: GetOptions) -> Result<Vec<Service>, RegistryError> {
        self.ensure_open()?;
        self.purge_expired();

        let domains = self.domains.read();
        let mut services: Vec<Service> = domains
            .iter()
            .filter(|(domain, _)| domain_matches(opts.domain.as_deref(), domain))
            .filter_map(|(_, names)| names.get(name))
            .flat_map(|versions| {
                versions
                    .iter()
                    .filter(|(_, record)| !record.nodes.is_empty())
                    .map(|(version, record)| record.to_service(name, version))
            })
            .collect();

        if services.is_empty() {
            return Err(RegistryError::NotFound);
        }
        services.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(services)
    }

    async fn list_services(&self, opts: ListOptions) -> Result<Vec<Service>, RegistryError> {
        self.ensure_open()?;
        self.purge_expired();

        let domains = self.domains.read();
        let names: BTreeSet<&String> = domains
            .iter()
            .filter(|(domain, _)| domain_matches(opts.domain.as_deref(), domain))
            .flat_map(|(_, names)| names.keys())
            .collect();

        Ok(names
            .into_iter()
            .map(|name| Service {
                name: name.clone(),
                ..Service::default()
            })
            .collect())
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>, RegistryError> {
        self.ensure_open()?;

        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.insert(
            id,
            WatcherSlot {
                service: opts.service,
                domain: domain_or_default(opts.domain.as_deref()).to_string(),
                tx,
            },
        );

        Ok(Box::new(MemoryWatcher {
            id,
            rx,
            stopped: CancellationToken::new(),
            watchers: Arc::clone(&self.watchers),
        }))
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.state.store(Arc::new(RegistryState::Closed));
        // Dropping every sender ends all watchers with `Closed`.
        self.watchers.clear();
        self.domains.write().clear();
        info!("memory registry closed");
        Ok(())
    }
}

/// Watcher over a [`MemoryRegistry`].
pub struct MemoryWatcher {
    id: u64,
    rx: mpsc::UnboundedReceiver<RegistryEvent>,
    stopped: CancellationToken,
    watchers: Arc<DashMap<u64, WatcherSlot>>,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<RegistryEvent, RegistryError> {
        if self.stopped.is_cancelled() {
            return Err(RegistryError::WatcherStopped);
        }
        tokio::select! {
            biased;
            () = self.stopped.cancelled() => Err(RegistryError::WatcherStopped),
            event = self.rx.recv() => event.ok_or(RegistryError::Closed),
        }
    }

    fn stop(&self) {
        self.stopped.cancel();
        self.watchers.remove(&self.id);
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.watchers.remove(&self.id);
    }
}

/// Factory handing out one shared [`MemoryRegistry`], so every component in
/// the process resolving `"memory"` sees the same membership.
pub struct MemoryRegistryFactory {
    registry: Arc<MemoryRegistry>,
}

impl MemoryRegistryFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MemoryRegistry::new()),
        }
    }
}

impl Default for MemoryRegistryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFactory for MemoryRegistryFactory {
    /// A bare `memory://` URL returns the shared registry as configured so
    /// far; any location, credentials or parameters re-apply its options.
    fn get_registry(&self, url: &Url) -> Result<Arc<dyn Registry>, RegistryError> {
        if url.location.is_empty() && url.username.is_empty() && url.params.is_empty() {
            if self.registry.state() == RegistryState::Closed {
                return Err(RegistryError::Closed);
            }
            return Ok(Arc::clone(&self.registry) as Arc<dyn Registry>);
        }

        let defaults = RegistryOptions::default();
        let timeout = url
            .params
            .get(REGISTRY_TIMEOUT_KEY)
            .and_then(|raw| parse_duration(raw).ok())
            .unwrap_or(defaults.timeout);

        self.registry.init(RegistryOptions {
            addrs: url.addresses(),
            timeout,
            username: url.username.clone(),
            password: url.password.clone(),
            params: url.params.clone(),
            ..defaults
        })?;
        Ok(Arc::clone(&self.registry) as Arc<dyn Registry>)
    }
}
