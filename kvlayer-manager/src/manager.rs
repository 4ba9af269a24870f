//! Config-driven store chain with hot reload.
//!
//! A [`Manager`] turns a [`ClientConfig`] into a chain of topology wrappers
//! and stands in for it: it implements [`KvStore`] by delegating to the
//! current chain. When the orchestrator publishes a new config the chain is
//! rebuilt and swapped; calls already running finish on the old chain.
//!
//! # Chain Order
//!
//! Innermost first:
//!
//! 1. base client for `servers`, or [`NullStore`] when disabled
//! 2. [`MigratingStore`] towards `new_servers`
//! 3. [`ReplicatedStore`] with `backup_servers`
//! 4. [`LoggingStore`] when `log_every_actions` and this process is sampled
//! 5. [`LocalCache`] when `local_cache_size` is set
//! 6. [`CleanerStore`] when the manager was given a cleaner
//!
//! A disabled client is the bare [`NullStore`]: local layers over it would
//! start caching again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use kvlayer_core::{CasToken, Expiry, KvResult, KvStore, NullStore, Value};
use kvlayer_topology::{
    Cleaner, CleanerStore, LocalCache, LoggingStore, MigratingStore, ReplicatedStore,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ManagerOptions};
use crate::factory::StoreFactory;

/// Layer names reported by [`Manager::layers`].
pub mod layer {
    pub const CLIENT: &str = "client";
    pub const NULL: &str = "null";
    pub const MIGRATING: &str = "migrating";
    pub const REPLICATED: &str = "replicated";
    pub const LOGGING: &str = "logging";
    pub const LOCAL: &str = "local";
    pub const CLEANER: &str = "cleaner";
}

/// A config update applied through [`Manager::receive_conf`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub version: String,
    pub applied_at: SystemTime,
}

struct Applied {
    config: ClientConfig,
    chain: Arc<dyn KvStore>,
    layers: Vec<&'static str>,
}

#[derive(Default)]
struct ReloadState {
    version: Option<String>,
    history: Vec<ConfigChange>,
}

pub struct Manager {
    factory: Arc<dyn StoreFactory>,
    options: ManagerOptions,
    cleaner: Option<Arc<dyn Cleaner>>,
    applied: RwLock<Applied>,
    reload: Mutex<ReloadState>,
}

impl Manager {
    pub fn new(
        config: ClientConfig,
        factory: Arc<dyn StoreFactory>,
        options: ManagerOptions,
    ) -> KvResult<Self> {
        Self::build(config, factory, options, None)
    }

    /// Like [`Manager::new`], handing keys of failed writes to `cleaner`.
    pub fn with_cleaner(
        config: ClientConfig,
        factory: Arc<dyn StoreFactory>,
        options: ManagerOptions,
        cleaner: Arc<dyn Cleaner>,
    ) -> KvResult<Self> {
        Self::build(config, factory, options, Some(cleaner))
    }

    fn build(
        config: ClientConfig,
        factory: Arc<dyn StoreFactory>,
        options: ManagerOptions,
        cleaner: Option<Arc<dyn Cleaner>>,
    ) -> KvResult<Self> {
        config.validate()?;
        let mut manager = Self {
            factory,
            options,
            cleaner,
            applied: RwLock::new(Applied {
                config: ClientConfig::default(),
                chain: Arc::new(NullStore::new()),
                layers: Vec::new(),
            }),
            reload: Mutex::new(ReloadState::default()),
        };
        let applied = manager.assemble(config);
        info!(layers = ?applied.layers, "cache client created");
        *manager
            .applied
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = applied;
        Ok(manager)
    }

    fn assemble(&self, config: ClientConfig) -> Applied {
        if self.options.disables(&config) {
            return Applied {
                config,
                chain: Arc::new(NullStore::new()),
                layers: vec![layer::NULL],
            };
        }

        let mut layers = vec![layer::CLIENT];
        let mut chain: Arc<dyn KvStore> = self.factory.create(&config.servers);

        if !config.new_servers.is_empty() {
            let target = self.factory.create(&config.new_servers);
            chain = Arc::new(MigratingStore::new(chain, target));
            layers.push(layer::MIGRATING);
        }

        if !config.backup_servers.is_empty() {
            let replica = self.factory.create(&config.backup_servers);
            chain = Arc::new(ReplicatedStore::new(chain, replica));
            layers.push(layer::REPLICATED);
        }

        if config.log_every_actions && self.options.log_sampled() {
            chain = Arc::new(LoggingStore::new(chain));
            layers.push(layer::LOGGING);
        }

        if let Some(bound) = config.local_cache_size {
            chain = Arc::new(LocalCache::with_bound(chain, bound));
            layers.push(layer::LOCAL);
        }

        if let Some(cleaner) = &self.cleaner {
            chain = Arc::new(CleanerStore::with_shared(chain, Arc::clone(cleaner)));
            layers.push(layer::CLEANER);
        }

        Applied {
            config,
            chain,
            layers,
        }
    }

    /// The chain calls are currently delegated to.
    pub fn current(&self) -> Arc<dyn KvStore> {
        Arc::clone(
            &self
                .applied
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .chain,
        )
    }

    pub fn config(&self) -> ClientConfig {
        self.applied
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    /// Layers of the current chain, innermost first.
    pub fn layers(&self) -> Vec<&'static str> {
        self.applied
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .layers
            .clone()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Path the orchestrator publishes updates of the current config under.
    pub fn config_path(&self) -> Option<String> {
        self.config().config_path
    }

    /// Version of the last config applied through [`Manager::receive_conf`].
    pub fn version(&self) -> Option<String> {
        self.reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .version
            .clone()
    }

    pub fn history(&self) -> Vec<ConfigChange> {
        self.reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    /// Apply `config`, rebuilding the chain. Returns `false` when it equals
    /// the current config and nothing was rebuilt.
    pub fn parse_config(&self, config: ClientConfig) -> KvResult<bool> {
        config.validate()?;
        if self.config() == config {
            return Ok(false);
        }

        // The old chain is dropped, never closed: in-flight calls may still
        // hold it.
        let applied = self.assemble(config);
        info!(layers = ?applied.layers, "cache client rebuilt");
        *self.applied.write().unwrap_or_else(PoisonError::into_inner) = applied;
        Ok(true)
    }

    /// Apply a config published by the orchestrator.
    ///
    /// `payload` is a JSON [`ClientConfig`]. A version equal to the last
    /// applied one is ignored. An invalid payload is rejected and the
    /// current chain stays in place. Returns whether the chain was rebuilt.
    ///
    /// The jitter pause runs without holding any lock, so [`Manager::version`]
    /// and [`Manager::history`] stay responsive during a reload.
    pub fn receive_conf(&self, payload: &str, version: &str) -> KvResult<bool> {
        if self.is_applied(version) {
            debug!(version, "config version already applied");
            return Ok(false);
        }

        let config = ClientConfig::from_json_str(payload).inspect_err(|e| {
            warn!(version, error = %e, "rejected config payload");
        })?;

        self.pause_before_reload();

        let mut reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        // Another delivery of the same version may have landed while we paused.
        if reload.version.as_deref() == Some(version) {
            debug!(version, "config version applied during reload pause");
            return Ok(false);
        }
        let rebuilt = self.parse_config(config)?;
        if rebuilt {
            reload.version = Some(version.to_string());
            reload.history.push(ConfigChange {
                version: version.to_string(),
                applied_at: SystemTime::now(),
            });
        }
        Ok(rebuilt)
    }

    fn is_applied(&self, version: &str) -> bool {
        let reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        reload.version.as_deref() == Some(version)
    }

    fn pause_before_reload(&self) {
        let bound = u64::try_from(self.options.reload_jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return;
        }
        let pause = rand::rng().random_range(0..=bound);
        std::thread::sleep(Duration::from_millis(pause));
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("layers", &self.layers())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl KvStore for Manager {
    fn get(&self, key: &str) -> Option<Value> {
        self.current().get(key)
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        self.current().gets(key)
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        self.current().get_multi(keys)
    }

    fn get_list(&self, keys: &[&str]) -> Vec<Option<Value>> {
        self.current().get_list(keys)
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        self.current().set(key, value, ttl, compress)
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.current().add(key, value, ttl)
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.current().replace(key, value, ttl)
    }

    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        self.current().cas(key, value, ttl, token)
    }

    fn delete(&self, key: &str) -> bool {
        self.current().delete(key)
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.current().incr(key, delta)
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.current().decr(key, delta)
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.current().append(key, data)
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.current().prepend(key, data)
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        self.current().touch(key, ttl)
    }

    fn expire(&self, key: &str) -> bool {
        self.current().expire(key)
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        self.current().set_multi(items, ttl, compress)
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        self.current().delete_multi(keys)
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.current().append_multi(keys, data)
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.current().prepend_multi(keys, data)
    }

    fn clear(&self) {
        self.current().clear()
    }

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        self.current().get_host_by_key(key)
    }

    fn close(&self) {
        self.current().close()
    }

    fn reset(&self) {
        self.current().reset()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::MemoryStoreFactory;
    use kvlayer_core::{ConfigError, KvError};
    use kvlayer_test_utils::FailingStore;

    fn options() -> ManagerOptions {
        ManagerOptions::default()
            .with_reload_jitter(Duration::ZERO)
            .with_pid(1)
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn memory() -> (Arc<MemoryStoreFactory>, Arc<dyn StoreFactory>) {
        let factory = Arc::new(MemoryStoreFactory::new());
        let shared: Arc<dyn StoreFactory> = factory.clone();
        (factory, shared)
    }

    #[test]
    fn test_plain_client() {
        let (clusters, factory) = memory();
        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options()).unwrap();
        assert_eq!(mc.layers(), vec![layer::CLIENT]);

        assert!(mc.set("k", &Value::raw("v"), 0, true));
        assert_eq!(mc.get("k"), Some(Value::raw("v")));
        assert!(clusters.cluster(&hosts(&["mc1"])).unwrap().contains("k"));
    }

    #[test]
    fn test_full_chain_order() {
        let (_, factory) = memory();
        let config = ClientConfig {
            new_servers: hosts(&["mc3"]),
            backup_servers: hosts(&["bk1"]),
            local_cache_size: Some(100),
            log_every_actions: true,
            ..ClientConfig::with_servers(["mc1", "mc2"])
        };
        let cleaner: Arc<dyn Cleaner> = Arc::new(|_: &str| {});
        let mc = Manager::with_cleaner(config, factory, options().with_pid(50), cleaner).unwrap();

        assert_eq!(
            mc.layers(),
            vec![
                layer::CLIENT,
                layer::MIGRATING,
                layer::REPLICATED,
                layer::LOGGING,
                layer::LOCAL,
                layer::CLEANER,
            ]
        );
    }

    #[test]
    fn test_logging_only_in_sampled_processes() {
        let (_, factory) = memory();
        let config = ClientConfig {
            log_every_actions: true,
            ..ClientConfig::with_servers(["mc1"])
        };
        let mc = Manager::new(config, factory, options().with_pid(26)).unwrap();
        assert_eq!(mc.layers(), vec![layer::CLIENT]);
    }

    #[test]
    fn test_disabled_by_host_list() {
        let (clusters, factory) = memory();
        let config = ClientConfig {
            disabled_client_hosts: hosts(&["batch-01"]),
            local_cache_size: Some(10),
            ..ClientConfig::with_servers(["mc1"])
        };
        let mc = Manager::new(config, factory, options().with_hostname("batch-01")).unwrap();

        assert_eq!(mc.layers(), vec![layer::NULL]);
        assert!(mc.set("k", &Value::raw("v"), 0, true));
        assert_eq!(mc.get("k"), None);
        assert_eq!(clusters.cluster_count(), 0);
    }

    #[test]
    fn test_disabled_by_flag_and_env_option() {
        let (_, factory) = memory();
        let config = ClientConfig {
            disabled: true,
            ..ClientConfig::default()
        };
        let mc = Manager::new(config, factory.clone(), options()).unwrap();
        assert_eq!(mc.layers(), vec![layer::NULL]);

        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options().disabled())
            .unwrap();
        assert_eq!(mc.layers(), vec![layer::NULL]);
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let (_, factory) = memory();
        let err = Manager::new(ClientConfig::default(), factory, options()).unwrap_err();
        assert!(matches!(err, KvError::Config(ConfigError::MissingRequired { .. })));
    }

    #[test]
    fn test_cleaner_fires_on_failed_writes() {
        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failed);
        let cleaner: Arc<dyn Cleaner> = Arc::new(move |key: &str| {
            sink.lock().unwrap().push(key.to_string());
        });
        let factory: Arc<dyn StoreFactory> =
            Arc::new(|_: &[String]| -> Arc<dyn KvStore> { Arc::new(FailingStore::new()) });
        let mc = Manager::with_cleaner(ClientConfig::with_servers(["mc1"]), factory, options(), cleaner)
            .unwrap();

        assert!(!mc.set("a", &Value::raw("v"), 0, true));
        assert!(!mc.delete("b"));
        assert_eq!(mc.get("c"), None);
        assert_eq!(*failed.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_config_unchanged() {
        let (_, factory) = memory();
        let config = ClientConfig::with_servers(["mc1"]);
        let mc = Manager::new(config.clone(), factory, options()).unwrap();
        let before = mc.current();

        assert!(!mc.parse_config(config).unwrap());
        assert!(Arc::ptr_eq(&before, &mc.current()));
    }

    #[test]
    fn test_parse_config_swaps_chain() {
        let (_, factory) = memory();
        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options()).unwrap();
        mc.set("k", &Value::raw("old cluster"), 0, true);

        assert!(mc.parse_config(ClientConfig::with_servers(["mc2"])).unwrap());
        assert_eq!(mc.get("k"), None);
        assert_eq!(mc.config().servers, hosts(&["mc2"]));
    }

    #[test]
    fn test_receive_conf_applies_and_records() {
        let (_, factory) = memory();
        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options()).unwrap();

        let payload = r#"{"servers": ["mc1"], "backup_servers": ["bk1"]}"#;
        assert!(mc.receive_conf(payload, "v2").unwrap());
        assert_eq!(mc.layers(), vec![layer::CLIENT, layer::REPLICATED]);
        assert_eq!(mc.version().as_deref(), Some("v2"));

        let history = mc.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, "v2");
    }

    #[test]
    fn test_receive_conf_skips_applied_version() {
        let (_, factory) = memory();
        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options()).unwrap();

        assert!(mc.receive_conf(r#"{"servers": ["mc2"]}"#, "v2").unwrap());
        assert!(!mc.receive_conf(r#"{"servers": ["mc3"]}"#, "v2").unwrap());
        assert_eq!(mc.config().servers, hosts(&["mc2"]));
        assert_eq!(mc.history().len(), 1);
    }

    #[test]
    fn test_receive_conf_unchanged_config_not_recorded() {
        let (_, factory) = memory();
        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options()).unwrap();

        assert!(!mc.receive_conf(r#"{"servers": ["mc1"]}"#, "v2").unwrap());
        assert_eq!(mc.version(), None);
        assert!(mc.history().is_empty());
    }

    #[test]
    fn test_receive_conf_rejects_invalid_payload() {
        let (_, factory) = memory();
        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options()).unwrap();
        let before = mc.current();

        for payload in ["__import__('os')", r#"{"servers": []}"#, r#"{"servers": "mc2"}"#] {
            assert!(mc.receive_conf(payload, "v2").is_err());
        }
        assert!(Arc::ptr_eq(&before, &mc.current()));
        assert_eq!(mc.version(), None);
    }

    #[test]
    fn test_in_flight_chain_survives_swap() {
        let (_, factory) = memory();
        let mc = Manager::new(ClientConfig::with_servers(["mc1"]), factory, options()).unwrap();
        let old = mc.current();

        mc.parse_config(ClientConfig::with_servers(["mc2"])).unwrap();
        assert!(old.set("k", &Value::raw("v"), 0, true));
        assert_eq!(old.get("k"), Some(Value::raw("v")));
        assert_eq!(mc.get("k"), None);
    }
}
