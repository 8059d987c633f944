//! Duracache - multi-instance in-memory cache with a durable mutation log
//!
//! Each named instance keeps its items in an LRU-ordered, optionally
//! expiring map with a per-item group index. Mutations can be captured by an
//! offline collector that appends them to a per-instance on-disk log; the
//! log is rotated by size, periodically compacted into a streamlined
//! snapshot, and replayed on startup so cache state survives restarts.
//!
//! ```no_run
//! use duracache::{CacheBundle, DumpInterval, InstanceConfig, PersistConfig, RewriteInterval};
//! use std::collections::HashMap;
//!
//! # fn main() -> duracache::Result<()> {
//! let persist = PersistConfig {
//!     root_path: "/var/lib/myapp/cache".into(),
//!     dump_interval: DumpInterval::Sync,
//!     rewrite_interval: RewriteInterval::OnStartup,
//!     write_limit_mib: Some(64),
//! };
//! let mut instances = HashMap::new();
//! instances.insert("sessions".to_string(), InstanceConfig::<String>::unbounded());
//!
//! let bundle = CacheBundle::with_persistence(persist, instances)?;
//! bundle.set("sessions", "user:1", "token".to_string(), &[]);
//! assert!(bundle.has_item("sessions", "user:1"));
//! bundle.shutdown();
//! # Ok(())
//! # }
//! ```

mod bundle;
mod cache;
mod collector;
mod lru;
mod ttl;

pub use bundle::{CacheBundle, DEFAULT_INSTANCE};
pub use cache::{Cache, CacheStats, EvictionCallback, InstanceConfig};
pub use collector::Collector;

pub use duracache_common::{
    Cloner, DumpInterval, Error, PersistConfig, Result, RewriteInterval,
};
pub use duracache_log::codec::ChangeRecord;
