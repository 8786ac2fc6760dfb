//! In-process config center.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use xmicro_core::constants::MEMORY_KEY;
use xmicro_core::{ChangeEvent, EventType, Url};

use super::listener::{ChangeCallback, ConfigSource, ListeningConfiguration};
use super::{ConfigError, DynamicConfiguration, DynamicConfigurationFactory};

type Key = (String, String);

fn key_of(key: &str, group: &str) -> Key {
    (group.to_string(), key.to_string())
}

/// Config source keeping values in a map and notifying watchers
/// synchronously from `publish` and `remove`.
#[derive(Default)]
pub struct MemoryConfigSource {
    values: RwLock<HashMap<Key, String>>,
    watchers: DashMap<Key, Vec<ChangeCallback>>,
}

impl MemoryConfigSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks currently watching `(key, group)`.
    #[must_use]
    pub fn watcher_count(&self, key: &str, group: &str) -> usize {
        self.watchers.get(&key_of(key, group)).map_or(0, |cbs| cbs.len())
    }

    fn notify(&self, key: &str, group: &str, event: &ChangeEvent) {
        // Clone out so callbacks never run under the map guard.
        let callbacks = self
            .watchers
            .get(&key_of(key, group))
            .map(|cbs| cbs.value().clone())
            .unwrap_or_default();
        for cb in callbacks {
            cb(event.clone());
        }
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    fn name(&self) -> &'static str {
        MEMORY_KEY
    }

    async fn listen(&self, key: &str, group: &str, on_change: ChangeCallback) -> Result<(), ConfigError> {
        self.watchers.entry(key_of(key, group)).or_default().push(on_change);
        Ok(())
    }

    async fn unlisten(&self, key: &str, group: &str, on_change: &ChangeCallback) -> Result<(), ConfigError> {
        let key = key_of(key, group);
        if let Some(mut callbacks) = self.watchers.get_mut(&key) {
            callbacks.retain(|cb| !Arc::ptr_eq(cb, on_change));
        }
        self.watchers.remove_if(&key, |_, callbacks| callbacks.is_empty());
        Ok(())
    }

    async fn get(&self, key: &str, group: &str) -> Result<String, ConfigError> {
        self.values
            .read()
            .get(&key_of(key, group))
            .cloned()
            .ok_or_else(|| ConfigError::NotFound {
                key: key.to_string(),
                group: group.to_string(),
            })
    }

    async fn publish(&self, key: &str, group: &str, value: &str) -> Result<(), ConfigError> {
        let previous = self.values.write().insert(key_of(key, group), value.to_string());
        let config_type = if previous.is_some() {
            EventType::Update
        } else {
            EventType::Add
        };
        debug!(key, group, %config_type, "memory config published");
        self.notify(
            key,
            group,
            &ChangeEvent {
                key: key.to_string(),
                value: value.to_string(),
                config_type,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str, group: &str) -> Result<(), ConfigError> {
        let removed = self.values.write().remove(&key_of(key, group));
        if removed.is_some() {
            self.notify(
                key,
                group,
                &ChangeEvent {
                    key: key.to_string(),
                    value: String::new(),
                    config_type: EventType::Delete,
                },
            );
        }
        Ok(())
    }

    async fn keys(&self, group: &str) -> Result<Vec<String>, ConfigError> {
        let mut keys: Vec<String> = self
            .values
            .read()
            .keys()
            .filter(|(g, _)| g == group)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Hands out configurations backed by one shared [`MemoryConfigSource`].
pub struct MemoryConfigurationFactory {
    source: Arc<MemoryConfigSource>,
}

impl MemoryConfigurationFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: Arc::new(MemoryConfigSource::new()),
        }
    }

    #[must_use]
    pub fn source(&self) -> Arc<MemoryConfigSource> {
        Arc::clone(&self.source)
    }
}

impl Default for MemoryConfigurationFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicConfigurationFactory for MemoryConfigurationFactory {
    fn get_dynamic_configuration(&self, url: &Url) -> Result<Arc<dyn DynamicConfiguration>, ConfigError> {
        debug!(url = %url, "building memory dynamic configuration");
        let source: Arc<dyn ConfigSource> = self.source();
        Ok(Arc::new(ListeningConfiguration::new(source)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::{ConfigOptions, ConfigurationListener};

    #[tokio::test]
    async fn publish_update_remove_emit_matching_event_types() {
        let factory = MemoryConfigurationFactory::new();
        let config = factory
            .get_dynamic_configuration(&Url::new("memory", ""))
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn ConfigurationListener> = Arc::new(move |e: &ChangeEvent| {
            let _ = tx.send(e.config_type);
        });
        config.add_listener("feature", listener, ConfigOptions::default()).await.unwrap();

        config.publish_config("feature", "micro", "on").await.unwrap();
        config.publish_config("feature", "micro", "off").await.unwrap();
        config.remove_config("feature", "micro").await.unwrap();

        // Dispatch is unordered, so compare as a multiset.
        let mut kinds = Vec::new();
        for _ in 0..3 {
            let kind = tokio::time::timeout(Duration::from_millis(500), rx.recv())
                .await
                .unwrap()
                .unwrap();
            kinds.push(kind.to_string());
        }
        kinds.sort();
        assert_eq!(kinds, vec!["add", "delete", "update"]);
    }

    #[tokio::test]
    async fn other_groups_are_not_notified() {
        let source = MemoryConfigSource::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        source
            .listen(
                "k",
                "micro",
                Arc::new(move |_: ChangeEvent| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        source.publish("k", "other", "v").await.unwrap();
        source.remove("missing", "micro").await.unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);

        source.publish("k", "micro", "v").await.unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// Places the watch on the memory source, then never returns.
    struct HangingSource {
        inner: MemoryConfigSource,
    }

    #[async_trait]
    impl ConfigSource for HangingSource {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn listen(&self, key: &str, group: &str, on_change: ChangeCallback) -> Result<(), ConfigError> {
            self.inner.listen(key, group, on_change).await?;
            std::future::pending().await
        }

        async fn unlisten(&self, key: &str, group: &str, on_change: &ChangeCallback) -> Result<(), ConfigError> {
            self.inner.unlisten(key, group, on_change).await
        }

        async fn get(&self, key: &str, group: &str) -> Result<String, ConfigError> {
            self.inner.get(key, group).await
        }

        async fn publish(&self, key: &str, group: &str, value: &str) -> Result<(), ConfigError> {
            self.inner.publish(key, group, value).await
        }

        async fn remove(&self, key: &str, group: &str) -> Result<(), ConfigError> {
            self.inner.remove(key, group).await
        }

        async fn keys(&self, group: &str) -> Result<Vec<String>, ConfigError> {
            self.inner.keys(group).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_watch_is_removed_from_source() {
        let source = Arc::new(HangingSource {
            inner: MemoryConfigSource::new(),
        });
        let config = ListeningConfiguration::new(Arc::clone(&source) as Arc<dyn ConfigSource>);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn ConfigurationListener> = Arc::new(move |e: &ChangeEvent| {
            let _ = tx.send(e.value.clone());
        });

        let opts = ConfigOptions::default().with_timeout(Duration::from_millis(50));
        assert!(matches!(
            config.add_listener("k", listener, opts).await,
            Err(ConfigError::Timeout(_))
        ));

        assert_eq!(source.inner.watcher_count("k", "micro"), 0);
        source.inner.publish("k", "micro", "late").await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unlisten_drops_only_the_matching_callback() {
        let source = MemoryConfigSource::new();
        let noop = |_: ChangeEvent| {};
        let a: ChangeCallback = Arc::new(noop);
        let b: ChangeCallback = Arc::new(noop);
        source.listen("k", "micro", Arc::clone(&a)).await.unwrap();
        source.listen("k", "micro", Arc::clone(&b)).await.unwrap();

        source.unlisten("k", "micro", &a).await.unwrap();
        assert_eq!(source.watcher_count("k", "micro"), 1);
        source.unlisten("k", "micro", &b).await.unwrap();
        assert_eq!(source.watcher_count("k", "micro"), 0);
    }

    #[tokio::test]
    async fn configurations_from_one_factory_share_values() {
        let factory = MemoryConfigurationFactory::new();
        let url = Url::new("memory", "");
        let a = factory.get_dynamic_configuration(&url).unwrap();
        let b = factory.get_dynamic_configuration(&url).unwrap();

        a.publish_config("x", "micro", "1").await.unwrap();
        b.publish_config("y", "micro", "2").await.unwrap();
        assert_eq!(b.get_properties("x", ConfigOptions::default()).await.unwrap(), "1");
        assert_eq!(a.get_config_keys_by_group("micro").await.unwrap(), vec!["x", "y"]);
    }
}
