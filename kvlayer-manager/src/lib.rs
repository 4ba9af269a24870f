//! kvlayer Manager - Config-Driven Clients
//!
//! Builds store chains from [`ClientConfig`] documents and keeps them
//! current as the orchestrator publishes updates.
//!
//! ```
//! use std::sync::Arc;
//! use kvlayer_core::{KvStore, Value};
//! use kvlayer_manager::{ClientConfig, ClientRegistry, ManagerOptions, MemoryStoreFactory};
//!
//! let registry = ClientRegistry::new(Arc::new(MemoryStoreFactory::new()), ManagerOptions::default());
//! let config = ClientConfig::from_yaml_str("servers: [mc1, mc2]\nlocal_cache_size: 1000\n").unwrap();
//! let mc = registry.get_or_create(&config).unwrap();
//! mc.set("greeting", &Value::raw("hello"), 60, true);
//! assert_eq!(mc.get("greeting"), Some(Value::raw("hello")));
//! ```

pub mod config;
pub mod factory;
pub mod manager;
pub mod registry;

pub use config::{ClientConfig, ManagerOptions, DEFAULT_RELOAD_JITTER, LOG_SAMPLE_MODULUS};
pub use factory::{MemoryStoreFactory, StoreFactory};
pub use manager::{layer, ConfigChange, Manager};
pub use registry::ClientRegistry;
