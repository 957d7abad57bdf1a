//! Tiered content cache.
//!
//! Each namespace gets a [`CacheService`] with two tiers:
//!
//! - **Memory**: process-local map with a byte budget and oldest-first
//!   eviction
//! - **Shared**: an external [`KvStore`] whose failures read as misses
//!
//! Domain events published on the [`EventBus`] invalidate stale entries
//! through the [`InvalidationBindings`] table.
//!
//! ```ignore
//! let registry = CacheRegistry::new(Some(Arc::new(InMemoryKvStore::new())));
//! let bus = EventBus::new();
//! let _bindings = InvalidationBindings::install(&bus, &registry)?;
//!
//! let content = registry.service("content")?;
//! let key = content.generate_key("item", "42");
//! let post: Post = content.get_or_set(&key, || repo.load(42), None).await?;
//!
//! bus.emit("content.update", json!({ "id": "42" })).await;
//! ```

mod bindings;
mod config;
mod error;
mod events;
mod glob;
mod keys;
mod lock;
mod memory;
mod registry;
mod service;
mod shared;
mod warming;

pub use bindings::{
    Action, BINDINGS, Binding, DEFAULT_RECENT_LIMIT, InvalidationBindings, invalidation_stats,
    recent_invalidations,
};
pub use config::{BUILTIN_NAMESPACES, CacheConfig, CacheOverride};
pub use error::{CacheError, HandlerError, KvError};
pub use events::{
    DEFAULT_LOG_CAPACITY, EventBus, EventRecord, EventStats, Handler, HandlerFuture, Subscription,
    WILDCARD,
};
pub use glob::GlobPattern;
pub use keys::{
    KEY_SEPARATOR, ParsedCacheKey, create_cache_pattern, generate_cache_key, hash_query_params,
    parse_cache_key,
};
pub use memory::{
    CacheEntry, DEFAULT_MEMORY_BUDGET_BYTES, MemoryStats, MemoryTier, SetOutcome, estimate_size,
};
pub use registry::CacheRegistry;
pub use service::{CacheResult, CacheService, CacheSource, CacheStats, EntryInfo, KeyInfo};
pub use shared::{InMemoryKvStore, KvStore, SharedTier};
pub use warming::{
    CacheWarmer, DEFAULT_WARM_LIMIT, WarmDetail, WarmError, WarmReport, WarmRow, WarmSource,
    warm_namespace,
};
