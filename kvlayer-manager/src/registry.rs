//! Process-wide reuse of managers.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use kvlayer_core::KvResult;
use kvlayer_topology::Cleaner;

use crate::config::{ClientConfig, ManagerOptions};
use crate::factory::StoreFactory;
use crate::manager::Manager;

/// Hands out one [`Manager`] per distinct config, so every component asking
/// for the same cluster shares its connections and local caches.
///
/// Managers are keyed by the config they were created from. A manager that
/// later reloads keeps its original key.
pub struct ClientRegistry {
    factory: Arc<dyn StoreFactory>,
    options: ManagerOptions,
    cleaner: Option<Arc<dyn Cleaner>>,
    clients: DashMap<String, Arc<Manager>>,
}

impl ClientRegistry {
    pub fn new(factory: Arc<dyn StoreFactory>, options: ManagerOptions) -> Self {
        Self {
            factory,
            options,
            cleaner: None,
            clients: DashMap::new(),
        }
    }

    /// Give managers created from now on a cleaner for failed writes.
    pub fn with_cleaner(mut self, cleaner: Arc<dyn Cleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// The manager for `config`, created on first request.
    pub fn get_or_create(&self, config: &ClientConfig) -> KvResult<Arc<Manager>> {
        let entry = self
            .clients
            .entry(config.canonical())
            .or_try_insert_with(|| self.create(config))?;
        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, config: &ClientConfig) -> Option<Arc<Manager>> {
        self.clients
            .get(&config.canonical())
            .map(|m| Arc::clone(m.value()))
    }

    /// Forget the manager for `config`. Holders keep using it; the next
    /// request creates a fresh one.
    pub fn invalidate(&self, config: &ClientConfig) -> Option<Arc<Manager>> {
        self.clients.remove(&config.canonical()).map(|(_, m)| m)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn create(&self, config: &ClientConfig) -> KvResult<Arc<Manager>> {
        let factory = Arc::clone(&self.factory);
        let options = self.options.clone();
        let manager = match &self.cleaner {
            Some(cleaner) => Manager::with_cleaner(config.clone(), factory, options, Arc::clone(cleaner))?,
            None => Manager::new(config.clone(), factory, options)?,
        };
        Ok(Arc::new(manager))
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::MemoryStoreFactory;
    use kvlayer_core::{KvStore, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(
            Arc::new(MemoryStoreFactory::new()),
            ManagerOptions::default().with_reload_jitter(Duration::ZERO),
        )
    }

    #[test]
    fn test_equal_configs_share_manager() {
        let registry = registry();
        let a = registry.get_or_create(&ClientConfig::with_servers(["mc1"])).unwrap();
        let b = registry.get_or_create(&ClientConfig::with_servers(["mc1"])).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_different_configs_get_different_managers() {
        let registry = registry();
        let a = registry.get_or_create(&ClientConfig::with_servers(["mc1"])).unwrap();
        let b = registry
            .get_or_create(&ClientConfig {
                local_cache_size: Some(10),
                ..ClientConfig::with_servers(["mc1"])
            })
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_get_and_invalidate() {
        let registry = registry();
        let config = ClientConfig::with_servers(["mc1"]);
        assert!(registry.get(&config).is_none());

        let created = registry.get_or_create(&config).unwrap();
        assert!(Arc::ptr_eq(&created, &registry.get(&config).unwrap()));

        let removed = registry.invalidate(&config).unwrap();
        assert!(Arc::ptr_eq(&created, &removed));
        assert!(registry.is_empty());

        let fresh = registry.get_or_create(&config).unwrap();
        assert!(!Arc::ptr_eq(&created, &fresh));
    }

    #[test]
    fn test_invalid_config_not_registered() {
        let registry = registry();
        assert!(registry.get_or_create(&ClientConfig::default()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_cleaner_applies() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let factory: Arc<dyn StoreFactory> = Arc::new(|_: &[String]| -> Arc<dyn KvStore> {
            Arc::new(kvlayer_test_utils::FailingStore::new())
        });
        let registry = ClientRegistry::new(factory, ManagerOptions::default()).with_cleaner(
            Arc::new(move |key: &str| sink.lock().unwrap().push(key.to_string())),
        );

        let mc = registry.get_or_create(&ClientConfig::with_servers(["mc1"])).unwrap();
        assert!(!mc.set("k", &Value::raw("v"), 0, true));
        assert_eq!(*seen.lock().unwrap(), vec!["k"]);
    }
}
