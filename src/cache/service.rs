//! Tiered cache service.
//!
//! Reads try the memory tier, then the shared tier (backfilling memory on a
//! shared hit), then report a miss. Writes go to every enabled tier
//! independently. Nothing here ever fails a caller because of a tier.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use super::config::{CacheConfig, CacheOverride};
use super::error::CacheError;
use super::glob::GlobPattern;
use super::keys::generate_cache_key;
use super::lock::mutex_lock;
use super::memory::MemoryTier;
use super::shared::SharedTier;

const SOURCE: &str = "cache::service";

const METRIC_MEMORY_HIT: &str = "tiercache_memory_hit_total";
const METRIC_MEMORY_MISS: &str = "tiercache_memory_miss_total";
const METRIC_KV_HIT: &str = "tiercache_kv_hit_total";
const METRIC_KV_MISS: &str = "tiercache_kv_miss_total";
const METRIC_MEMORY_EVICT: &str = "tiercache_memory_evict_total";
const METRIC_INVALIDATED: &str = "tiercache_invalidated_total";

/// Counters for one namespace.
///
/// Counters only grow until `clear()`. `memory_size` and `entry_count` are
/// snapshots of the memory tier taken when the stats are read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub kv_hits: u64,
    pub kv_misses: u64,
    /// Values supplied by a `get_or_set` fetcher.
    pub db_hits: u64,
    pub total_requests: u64,
    /// Percentage of lookups answered by either tier.
    pub hit_rate: f64,
    pub memory_size: usize,
    pub entry_count: usize,
}

impl CacheStats {
    fn update_hit_rate(&mut self) {
        self.hit_rate = if self.total_requests > 0 {
            (self.memory_hits + self.kv_hits) as f64 / self.total_requests as f64 * 100.0
        } else {
            0.0
        };
    }
}

/// Tier that answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Memory,
    Kv,
    Miss,
}

/// Lookup result annotated with its source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
    pub data: Option<T>,
    pub source: CacheSource,
    pub hit: bool,
    /// Write time, known only for memory hits.
    pub timestamp: Option<OffsetDateTime>,
    /// Remaining lifetime, known only for memory hits.
    pub ttl: Option<Duration>,
}

impl<T> CacheResult<T> {
    fn miss() -> Self {
        Self {
            data: None,
            source: CacheSource::Miss,
            hit: false,
            timestamp: None,
            ttl: None,
        }
    }
}

/// Memory-tier key listing row.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub key: String,
    pub size: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub age: Duration,
}

/// Memory-tier entry with metadata.
#[derive(Debug, Clone)]
pub struct EntryInfo<T> {
    pub data: T,
    pub timestamp: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub ttl: Duration,
    pub size: usize,
}

/// Multi-tier cache for a single namespace.
pub struct CacheService {
    config: CacheConfig,
    memory: MemoryTier,
    shared: Option<SharedTier>,
    stats: Mutex<CacheStats>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("config", &self.config)
            .field("memory", &self.memory)
            .field("shared", &self.shared.is_some())
            .finish()
    }
}

impl CacheService {
    pub fn new(config: CacheConfig, shared: Option<SharedTier>) -> Self {
        Self::with_memory_tier(config, shared, MemoryTier::new())
    }

    pub fn with_memory_tier(
        config: CacheConfig,
        shared: Option<SharedTier>,
        memory: MemoryTier,
    ) -> Self {
        Self {
            config,
            memory,
            shared,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn shared_tier(&self, config: &CacheConfig) -> Option<&SharedTier> {
        if config.kv_enabled {
            self.shared.as_ref()
        } else {
            None
        }
    }

    fn record(&self, op: &'static str, update: impl FnOnce(&mut CacheStats)) {
        let mut stats = mutex_lock(&self.stats, SOURCE, op);
        update(&mut stats);
        stats.update_hit_rate();
    }

    fn count(&self, metric: &'static str) {
        counter!(metric, "namespace" => self.config.namespace.clone()).increment(1);
    }

    /// Shared lookup path for `get` and `get_with_source`.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        self.record("lookup.request", |stats| stats.total_requests += 1);

        if self.config.memory_enabled {
            if let Some(entry) = self.memory.entry(key) {
                match serde_json::from_value::<T>(entry.data.clone()) {
                    Ok(data) => {
                        self.record("lookup.memory_hit", |stats| stats.memory_hits += 1);
                        self.count(METRIC_MEMORY_HIT);
                        debug!(namespace = %self.config.namespace, key, source = "memory", "Cache hit");
                        let result = CacheResult {
                            data: Some(data),
                            source: CacheSource::Memory,
                            hit: true,
                            timestamp: Some(entry.timestamp),
                            ttl: Some(entry.remaining_ttl()),
                        };
                        return result;
                    }
                    Err(error) => {
                        warn!(key, error = %error, "Memory cache value has unexpected shape");
                    }
                }
            }
            self.record("lookup.memory_miss", |stats| stats.memory_misses += 1);
            self.count(METRIC_MEMORY_MISS);
        }

        if let Some(shared) = self.shared_tier(&self.config) {
            if let Some(value) = shared.get(key).await {
                match serde_json::from_value::<T>(value.clone()) {
                    Ok(data) => {
                        self.record("lookup.kv_hit", |stats| stats.kv_hits += 1);
                        self.count(METRIC_KV_HIT);
                        debug!(namespace = %self.config.namespace, key, source = "kv", "Cache hit");

                        if self.config.memory_enabled {
                            self.store_in_memory(key, value, &self.config);
                        }

                        let result = CacheResult {
                            data: Some(data),
                            source: CacheSource::Kv,
                            hit: true,
                            timestamp: None,
                            ttl: None,
                        };
                        return result;
                    }
                    Err(error) => {
                        warn!(key, error = %error, "Shared cache value has unexpected shape");
                    }
                }
            }
            self.record("lookup.kv_miss", |stats| stats.kv_misses += 1);
            self.count(METRIC_KV_MISS);
        }

        debug!(namespace = %self.config.namespace, key, "Cache miss");
        CacheResult::miss()
    }

    fn store_in_memory(&self, key: &str, value: Value, config: &CacheConfig) {
        let outcome = self
            .memory
            .set(key, value, config.ttl_seconds, &config.version);
        if outcome.evicted > 0 {
            counter!(METRIC_MEMORY_EVICT, "namespace" => self.config.namespace.clone())
                .increment(outcome.evicted as u64);
        }
    }

    /// Look a key up in memory, then the shared tier.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key).await.data
    }

    /// Like `get`, but reports which tier answered.
    pub async fn get_with_source<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        self.lookup(key).await
    }

    /// Whether any tier currently holds `key`.
    pub async fn has(&self, key: &str) -> bool {
        self.get::<Value>(key).await.is_some()
    }

    /// Write to every tier enabled by the effective policy.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        overrides: Option<&CacheOverride>,
    ) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(error) => {
                warn!(key, error = %error, "Cache value could not be serialized; skipping write");
                return;
            }
        };
        let config = self.config.merged(overrides);

        if config.memory_enabled {
            self.store_in_memory(key, value.clone(), &config);
        }

        if let Some(shared) = self.shared_tier(&config) {
            shared.put(key, &value, config.ttl_seconds).await;
        }
    }

    /// Remove a key from every enabled tier. Absence is not an error.
    pub async fn delete(&self, key: &str) {
        if self.config.memory_enabled {
            self.memory.delete(key);
        }
        if let Some(shared) = self.shared_tier(&self.config) {
            shared.delete(key).await;
        }
        debug!(namespace = %self.config.namespace, key, "Cache key deleted");
    }

    /// Empty the memory tier and reset statistics.
    ///
    /// The shared tier is left alone; use `invalidate("*")` to purge it.
    pub fn clear(&self) {
        self.memory.clear();
        *mutex_lock(&self.stats, SOURCE, "clear") = CacheStats::default();
        info!(namespace = %self.config.namespace, "Cache cleared");
    }

    /// Remove every key matching a glob from both tiers.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = GlobPattern::new(pattern)?;
        Ok(self.invalidate_glob(&pattern).await)
    }

    /// Alias of [`CacheService::invalidate`].
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        self.invalidate(pattern).await
    }

    /// Invalidate with an already compiled pattern.
    ///
    /// The count includes shared-tier keys only when their delete succeeded;
    /// a dropped delete leaves the shared entry until its own TTL runs out.
    #[instrument(skip(self, pattern), fields(namespace = %self.config.namespace, pattern = %pattern))]
    pub async fn invalidate_glob(&self, pattern: &GlobPattern) -> usize {
        let mut count = 0;

        if self.config.memory_enabled {
            count += self.memory.invalidate_pattern(pattern);
        }

        if let Some(shared) = self.shared_tier(&self.config) {
            let keys = shared.list_by_prefix(&self.listing_prefix(pattern)).await;
            for key in keys.iter().filter(|key| pattern.matches(key)) {
                if shared.delete(key).await {
                    count += 1;
                }
            }
        }

        counter!(METRIC_INVALIDATED, "namespace" => self.config.namespace.clone())
            .increment(count as u64);
        info!(count, "Cache pattern invalidated");
        count
    }

    /// Narrowest prefix that still covers every namespace key `pattern`
    /// can match.
    fn listing_prefix(&self, pattern: &GlobPattern) -> String {
        let namespace_prefix = self.config.key_prefix();
        let literal = pattern.literal_prefix();
        if literal.starts_with(&namespace_prefix) {
            literal.to_string()
        } else {
            namespace_prefix
        }
    }

    /// `namespace:type:identifier[:version]` for this service.
    pub fn generate_key(&self, key_type: &str, identifier: &str) -> String {
        generate_cache_key(
            &self.config.namespace,
            key_type,
            identifier,
            &self.config.version,
        )
    }

    /// Cache-aside read.
    ///
    /// On a miss the fetcher runs once and its value is written back.
    /// Concurrent misses on the same key are not coalesced; each caller may
    /// fetch and the last write wins. Fetcher errors go straight to the
    /// caller and nothing is cached.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        overrides: Option<&CacheOverride>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(cached);
        }

        let value = fetcher().await?;
        self.record("get_or_set.fetch", |stats| stats.db_hits += 1);
        self.set(key, &value, overrides).await;
        Ok(value)
    }

    /// Sequential `get` over several keys; misses are left out.
    pub async fn get_many<T, I, K>(&self, keys: I) -> HashMap<String, T>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut found = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            if let Some(value) = self.get::<T>(key).await {
                found.insert(key.to_string(), value);
            }
        }
        found
    }

    /// Sequential `set`; no atomicity across the batch.
    pub async fn set_many<T, I, K>(&self, entries: I, overrides: Option<&CacheOverride>)
    where
        T: Serialize,
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
    {
        for (key, value) in entries {
            self.set(key.as_ref(), &value, overrides).await;
        }
    }

    /// Sequential `delete`.
    pub async fn delete_many<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            self.delete(key.as_ref()).await;
        }
    }

    /// Preload entries with the base policy.
    pub async fn warm_cache<T, I, K>(&self, entries: I)
    where
        T: Serialize,
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
    {
        self.set_many(entries, None).await;
    }

    /// Memory-tier keys, newest write first.
    pub fn list_keys(&self) -> Vec<KeyInfo> {
        if !self.config.memory_enabled {
            return Vec::new();
        }

        let mut keys: Vec<KeyInfo> = self
            .memory
            .snapshot()
            .into_iter()
            .map(|(key, entry)| KeyInfo {
                size: entry.size(),
                expires_at: entry.expires_at,
                age: entry.age(),
                key,
            })
            .collect();
        keys.sort_by(|a, b| a.age.cmp(&b.age).then_with(|| a.key.cmp(&b.key)));
        keys
    }

    /// Memory-tier entry with its metadata, if live.
    pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<EntryInfo<T>> {
        if !self.config.memory_enabled {
            return None;
        }

        let entry = self.memory.entry(key)?;
        let data = match serde_json::from_value::<T>(entry.data.clone()) {
            Ok(data) => data,
            Err(error) => {
                warn!(key, error = %error, "Memory cache value has unexpected shape");
                return None;
            }
        };

        Some(EntryInfo {
            data,
            timestamp: entry.timestamp,
            expires_at: entry.expires_at,
            ttl: entry.remaining_ttl(),
            size: entry.size(),
        })
    }

    pub fn get_stats(&self) -> CacheStats {
        let memory = self.memory.stats();
        let mut stats = mutex_lock(&self.stats, SOURCE, "get_stats").clone();
        stats.memory_size = memory.size;
        stats.entry_count = memory.count;
        stats
    }
}
