//! Creating base clients from server lists.

use std::sync::Arc;

use dashmap::DashMap;
use kvlayer_core::{KvStore, MemoryStore};

/// Creates the client for a list of servers. Network drivers implement this;
/// the manager only ever sees the resulting [`KvStore`].
pub trait StoreFactory: Send + Sync {
    fn create(&self, servers: &[String]) -> Arc<dyn KvStore>;
}

impl<F> StoreFactory for F
where
    F: Fn(&[String]) -> Arc<dyn KvStore> + Send + Sync,
{
    fn create(&self, servers: &[String]) -> Arc<dyn KvStore> {
        self(servers)
    }
}

/// In-process factory. Each distinct server list is one cluster; creating a
/// client for the same list again reaches the same data, as reconnecting to
/// the same servers would.
#[derive(Debug, Default)]
pub struct MemoryStoreFactory {
    clusters: DashMap<Vec<String>, Arc<MemoryStore>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cluster behind `servers`, if a client for it was created.
    pub fn cluster(&self, servers: &[String]) -> Option<Arc<MemoryStore>> {
        self.clusters.get(servers).map(|c| Arc::clone(c.value()))
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn create(&self, servers: &[String]) -> Arc<dyn KvStore> {
        let cluster = self
            .clusters
            .entry(servers.to_vec())
            .or_insert_with(|| Arc::new(MemoryStore::with_servers(servers.iter().cloned())));
        let store: Arc<MemoryStore> = Arc::clone(cluster.value());
        store
    }
}
