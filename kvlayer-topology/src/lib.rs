//! kvlayer Topology - Composable Store Wrappers
//!
//! Each wrapper implements [`KvStore`](kvlayer_core::KvStore) around one or
//! two inner stores, so wrappers chain in any order, e.g. a
//! [`VersionedLocalCache`] around a [`ReplicatedStore`] around a
//! [`MigratingStore`].
//!
//! | Wrapper | Adds |
//! |---|---|
//! | [`MigratingStore`] | live shard migration from an old node set to a new one |
//! | [`ReplicatedStore`] | failover reads from a replica that expires first |
//! | [`LocalCache`] | bounded per-process read cache |
//! | [`VersionedLocalCache`] | per-process cache validated against a published version |
//! | [`PairedInvalidationStore`] | keeps a secondary cache invalidated on writes |
//! | [`CleanerStore`] | reports keys whose writes failed |
//! | [`LoggingStore`] | per-call tracing and call statistics |

pub mod cleaner;
pub mod local;
pub mod logging;
pub mod migrating;
pub mod paired;
pub mod replicated;
pub mod versioned;

pub use cleaner::{Cleaner, CleanerStore};
pub use local::{LocalCache, LocalCacheStats, DEFAULT_LOCAL_CACHE_SIZE};
pub use logging::{CallSummary, LoggingStore};
pub use migrating::{MigratingStore, MIGRATION_TTL};
pub use paired::PairedInvalidationStore;
pub use replicated::{ReplicatedStore, REPOPULATE_TTL};
pub use versioned::VersionedLocalCache;
