//! Listener bookkeeping shared by every config-center backend.
//!
//! Backends implement the small [`ConfigSource`] SPI; [`ListeningConfiguration`]
//! layers the [`DynamicConfiguration`] contract on top: one backend watch per
//! key, one spawned task per delivered change.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xmicro_core::constants::DEFAULT_CONFIG_FILE;
use xmicro_core::ChangeEvent;

use super::{
    ConfigError, ConfigOptions, ConfigurationListener, ConfigurationParser, DynamicConfiguration, PropertiesParser,
};

/// Invoked by a backend for every remote change of a watched key.
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Minimal config-center backend.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Registers a watch on `(key, group)`. Must return once the watch is in
    /// place; changes are delivered through `on_change` afterwards.
    async fn listen(&self, key: &str, group: &str, on_change: ChangeCallback) -> Result<(), ConfigError>;

    /// Drops a watch placed by [`listen`](ConfigSource::listen), matched by
    /// callback identity. Unknown callbacks are ignored.
    async fn unlisten(&self, key: &str, group: &str, on_change: &ChangeCallback) -> Result<(), ConfigError>;

    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] for an absent key.
    async fn get(&self, key: &str, group: &str) -> Result<String, ConfigError>;

    async fn publish(&self, key: &str, group: &str, value: &str) -> Result<(), ConfigError>;

    async fn remove(&self, key: &str, group: &str) -> Result<(), ConfigError>;

    async fn keys(&self, group: &str) -> Result<Vec<String>, ConfigError>;
}

/// Listener registered for a key, with its (currently inert) cancel handle.
struct ListenerEntry {
    listener: Arc<dyn ConfigurationListener>,
    cancel: CancellationToken,
}

fn listener_id(listener: &Arc<dyn ConfigurationListener>) -> usize {
    Arc::as_ptr(listener).cast::<()>().addr()
}

/// [`DynamicConfiguration`] over any [`ConfigSource`].
pub struct ListeningConfiguration {
    source: Arc<dyn ConfigSource>,
    parser: RwLock<Arc<dyn ConfigurationParser>>,
    /// key -> listener identity -> entry.
    listeners: Arc<DashMap<String, DashMap<usize, ListenerEntry>>>,
}

impl ListeningConfiguration {
    #[must_use]
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            parser: RwLock::new(Arc::new(PropertiesParser)),
            listeners: Arc::new(DashMap::new()),
        }
    }

    /// Keys with an active backend watch.
    #[must_use]
    pub fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    async fn read(&self, key: &str, opts: &ConfigOptions) -> Result<String, ConfigError> {
        tokio::time::timeout(opts.timeout, self.source.get(key, &opts.group))
            .await
            .map_err(|_| ConfigError::Timeout(opts.timeout))?
    }
}

#[async_trait]
impl DynamicConfiguration for ListeningConfiguration {
    fn parser(&self) -> Arc<dyn ConfigurationParser> {
        Arc::clone(&self.parser.read())
    }

    fn set_parser(&self, parser: Arc<dyn ConfigurationParser>) {
        *self.parser.write() = parser;
    }

    async fn add_listener(
        &self,
        key: &str,
        listener: Arc<dyn ConfigurationListener>,
        opts: ConfigOptions,
    ) -> Result<(), ConfigError> {
        // Reserve the key before the backend call so concurrent adds for the
        // same key cannot both reach the backend.
        match self.listeners.entry(key.to_string()) {
            Entry::Occupied(_) => {
                info!(key, group = %opts.group, "config listener already registered; ignoring");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                let entries = DashMap::new();
                entries.insert(
                    listener_id(&listener),
                    ListenerEntry {
                        listener,
                        cancel: CancellationToken::new(),
                    },
                );
                slot.insert(entries);
            }
        }

        let handle = Handle::current();
        let listeners = Arc::clone(&self.listeners);
        let watched = key.to_string();
        let reservation = CancellationToken::new();
        let live = reservation.clone();
        let on_change: ChangeCallback = Arc::new(move |event: ChangeEvent| {
            if live.is_cancelled() {
                return;
            }
            let Some(entries) = listeners.get(&watched) else {
                return;
            };
            for entry in entries.iter().filter(|e| !e.cancel.is_cancelled()) {
                let listener = Arc::clone(&entry.listener);
                let event = event.clone();
                handle.spawn(async move {
                    debug!(key = %event.key, kind = %event.config_type, "dispatching config change");
                    listener.process(&event);
                });
            }
        });

        let watch = self.source.listen(key, &opts.group, Arc::clone(&on_change));
        let err = match tokio::time::timeout(opts.timeout, watch).await {
            Ok(Ok(())) => {
                info!(key, group = %opts.group, source = self.source.name(), "config listener added");
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => ConfigError::Timeout(opts.timeout),
        };

        // The backend may have placed the watch before failing.
        reservation.cancel();
        self.listeners.remove(key);
        match tokio::time::timeout(opts.timeout, self.source.unlisten(key, &opts.group, &on_change)).await {
            Ok(Ok(())) => {}
            Ok(Err(unlisten_err)) => warn!(key, error = %unlisten_err, "dropping failed config watch"),
            Err(_) => warn!(key, "dropping failed config watch timed out"),
        }
        Err(err)
    }

    fn remove_listener(&self, key: &str, listener: &Arc<dyn ConfigurationListener>, opts: ConfigOptions) {
        let registered = self
            .listeners
            .get(key)
            .is_some_and(|entries| entries.contains_key(&listener_id(listener)));
        warn!(key, group = %opts.group, registered, "removing config listeners is not supported");
    }

    async fn get_properties(&self, key: &str, opts: ConfigOptions) -> Result<String, ConfigError> {
        self.read(key, &opts).await
    }

    async fn get_rule(&self, key: &str, opts: ConfigOptions) -> Result<String, ConfigError> {
        self.read(key, &opts).await
    }

    async fn get_internal_property(&self, key: &str, opts: ConfigOptions) -> Result<String, ConfigError> {
        let content = self.read(DEFAULT_CONFIG_FILE, &opts).await?;
        let parser = self.parser();
        parser
            .parse(&content)?
            .remove(key)
            .ok_or_else(|| ConfigError::NotFound {
                key: key.to_string(),
                group: opts.group.clone(),
            })
    }

    async fn publish_config(&self, key: &str, group: &str, value: &str) -> Result<(), ConfigError> {
        self.source.publish(key, group, value).await
    }

    async fn remove_config(&self, key: &str, group: &str) -> Result<(), ConfigError> {
        self.source.remove(key, group).await
    }

    async fn get_config_keys_by_group(&self, group: &str) -> Result<Vec<String>, ConfigError> {
        self.source.keys(group).await
    }
}
