//! Process-local cache tier.
//!
//! A byte-budgeted map from key to entry. Expiry is discovered lazily on
//! read; there is no background sweep. When a write would exceed the budget,
//! entries are evicted oldest-write-first (insertion time, not access time).
//!
//! Expiry, eviction order and ages run on the monotonic clock. Wall-clock
//! times are kept only for reporting.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use super::glob::GlobPattern;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::memory";

/// Default byte budget for one memory tier (50 MiB).
pub const DEFAULT_MEMORY_BUDGET_BYTES: usize = 50 * 1024 * 1024;

// Keeps `timestamp + ttl` representable.
const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// A stored value with its bookkeeping.
///
/// `expires_at == timestamp + ttl`. Entries are replaced wholesale and never
/// mutated in place.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Value,
    /// Wall-clock write time, for display.
    pub timestamp: OffsetDateTime,
    /// Wall-clock expiry, for display.
    pub expires_at: OffsetDateTime,
    pub version: String,
    size: usize,
    seq: u64,
    stored_at: Instant,
    deadline: Instant,
}

impl CacheEntry {
    fn new(data: Value, ttl_seconds: u64, version: &str, seq: u64) -> Self {
        let ttl_seconds = ttl_seconds.min(MAX_TTL_SECONDS);
        let stored_at = Instant::now();
        let timestamp = OffsetDateTime::now_utc();
        let mut entry = Self {
            data,
            timestamp,
            expires_at: timestamp + Duration::seconds(ttl_seconds as i64),
            version: version.to_string(),
            size: 0,
            seq,
            stored_at,
            deadline: stored_at + std::time::Duration::from_secs(ttl_seconds),
        };
        entry.size = estimate_size(&entry);
        entry
    }

    /// Estimated footprint used for budget accounting.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.deadline
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining_ttl(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Time since the write.
    pub fn age(&self) -> std::time::Duration {
        self.stored_at.elapsed()
    }
}

#[derive(Serialize)]
struct SizedView<'a> {
    data: &'a Value,
    timestamp: i128,
    expires_at: i128,
    version: &'a str,
}

/// Size heuristic: length of the serialized entry, doubled.
///
/// This approximates a UTF-16 in-memory footprint and is the accounting
/// rule eviction is defined against. Serialization failures account the
/// entry as zero bytes rather than refusing to cache it.
pub fn estimate_size(entry: &CacheEntry) -> usize {
    let view = SizedView {
        data: &entry.data,
        timestamp: entry.timestamp.unix_timestamp_nanos() / 1_000_000,
        expires_at: entry.expires_at.unix_timestamp_nanos() / 1_000_000,
        version: &entry.version,
    };
    match serde_json::to_string(&view) {
        Ok(text) => text.len() * 2,
        Err(error) => {
            warn!(error = %error, "Cache entry size estimation failed; accounting as 0 bytes");
            0
        }
    }
}

/// Point-in-time memory tier figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub size: usize,
    pub count: usize,
}

/// Result of a memory write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOutcome {
    pub stored: bool,
    pub evicted: usize,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, CacheEntry>,
    current_size: usize,
    next_seq: u64,
}

impl MemoryState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.current_size = self.current_size.saturating_sub(entry.size);
        Some(entry)
    }
}

/// Process-local tier owned by a single `CacheService`.
pub struct MemoryTier {
    state: RwLock<MemoryState>,
    max_size: usize,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MEMORY_BUDGET_BYTES)
    }

    pub fn with_budget(max_size: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            max_size,
        }
    }

    pub fn budget(&self) -> usize {
        self.max_size
    }

    /// Look up a live value, dropping it if it has expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entry(key).map(|entry| entry.data)
    }

    /// Look up a live entry with its metadata, dropping it if it has expired.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        {
            let state = rw_read(&self.state, SOURCE, "entry");
            match state.entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired_at(now) => return Some(entry.clone()),
                Some(_) => {}
            }
        }

        let mut state = rw_write(&self.state, SOURCE, "entry.expire");
        if state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired_at(now))
        {
            state.remove(key);
            debug!(key, "Memory cache entry expired");
        }
        None
    }

    /// Store a value, evicting the oldest writes if the budget requires it.
    ///
    /// An entry larger than the whole budget is not stored; any previous
    /// value under the same key is still removed so it cannot be served.
    pub fn set(&self, key: &str, value: Value, ttl_seconds: u64, version: &str) -> SetOutcome {
        let mut state = rw_write(&self.state, SOURCE, "set");

        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = CacheEntry::new(value, ttl_seconds, version, seq);

        state.remove(key);

        if entry.size > self.max_size {
            debug!(
                key,
                entry_size = entry.size,
                budget = self.max_size,
                "Memory cache entry exceeds budget; not stored"
            );
            return SetOutcome::default();
        }

        let evicted = if state.current_size + entry.size > self.max_size {
            Self::evict_oldest(&mut state, entry.size, self.max_size)
        } else {
            0
        };

        state.current_size += entry.size;
        state.entries.insert(key.to_string(), entry);

        SetOutcome {
            stored: true,
            evicted,
        }
    }

    fn evict_oldest(state: &mut MemoryState, incoming: usize, budget: usize) -> usize {
        // Write sequence, not wall time, so a clock step cannot reorder writes.
        let mut order: Vec<(u64, String)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.seq, key.clone()))
            .collect();
        order.sort_unstable();

        let mut evicted = 0;
        for (_, key) in order {
            if state.current_size + incoming <= budget {
                break;
            }
            if state.remove(&key).is_some() {
                evicted += 1;
                debug!(key = %key, "Memory cache entry evicted");
            }
        }
        evicted
    }

    pub fn delete(&self, key: &str) -> bool {
        rw_write(&self.state, SOURCE, "delete").remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.current_size = 0;
    }

    /// Remove every key matching `pattern`, returning how many were removed.
    pub fn invalidate_pattern(&self, pattern: &GlobPattern) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "invalidate_pattern");
        let matching: Vec<String> = state
            .entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect();

        for key in &matching {
            state.remove(key);
        }
        matching.len()
    }

    /// Live entries, dropping any found expired along the way.
    pub fn snapshot(&self) -> Vec<(String, CacheEntry)> {
        let now = Instant::now();
        let mut state = rw_write(&self.state, SOURCE, "snapshot");

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }

        state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    pub fn stats(&self) -> MemoryStats {
        let state = rw_read(&self.state, SOURCE, "stats");
        MemoryStats {
            size: state.current_size,
            count: state.entries.len(),
        }
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemoryTier")
            .field("budget", &self.max_size)
            .field("size", &stats.size)
            .field("count", &stats.count)
            .finish()
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}
