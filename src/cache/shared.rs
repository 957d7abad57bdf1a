//! Shared key/value tier.
//!
//! `KvStore` is the boundary to an external, eventually consistent store.
//! `SharedTier` wraps it and turns every store failure into a logged miss or
//! no-op so callers never see it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::KvError;

const METRIC_KV_ERROR: &str = "tiercache_kv_error_total";
const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// External key/value store with TTL writes and prefix listing.
///
/// Payloads are JSON text; each tier serializes on its own.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn put(&self, key: &str, payload: String, ttl_seconds: u64) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Every live key starting with `prefix`. Expensive on real stores.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

/// Adapter that makes the shared store failure-transparent.
#[derive(Clone)]
pub struct SharedTier {
    store: Arc<dyn KvStore>,
}

impl SharedTier {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read and decode a value; failures read as a miss.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let payload = match self.store.get(key).await {
            Ok(payload) => payload?,
            Err(error) => {
                record_failure("get", key, &error);
                return None;
            }
        };

        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(error) => {
                record_failure("get", key, &KvError::from(error));
                None
            }
        }
    }

    /// Write a value with a TTL. Returns false if the write was dropped.
    pub async fn put(&self, key: &str, value: &Value, ttl_seconds: u64) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(error) => {
                record_failure("put", key, &KvError::from(error));
                return false;
            }
        };

        match self.store.put(key, payload, ttl_seconds).await {
            Ok(()) => true,
            Err(error) => {
                record_failure("put", key, &error);
                false
            }
        }
    }

    /// Delete a key. Returns false if the delete was dropped.
    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(()) => true,
            Err(error) => {
                record_failure("delete", key, &error);
                false
            }
        }
    }

    /// List keys under `prefix`; failures list nothing.
    pub async fn list_by_prefix(&self, prefix: &str) -> Vec<String> {
        match self.store.list(prefix).await {
            Ok(keys) => keys,
            Err(error) => {
                record_failure("list", prefix, &error);
                Vec::new()
            }
        }
    }
}

fn record_failure(op: &'static str, key: &str, error: &KvError) {
    warn!(op, key, error = %error, "Shared cache tier operation failed");
    counter!(METRIC_KV_ERROR, "op" => op).increment(1);
}

/// In-process `KvStore` with TTL handling.
///
/// Stands in for a network store in tests and in the replay tool. It can be
/// flipped into an unavailable state to exercise failure paths.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, (String, Instant)>,
    unavailable: AtomicBool,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored keys, including ones not yet found expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> Result<(), KvError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::unavailable("in-memory store marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.ensure_available()?;
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if now <= entry.1 => return Ok(Some(entry.0.clone())),
            Some(_) => true,
        };

        if expired {
            self.entries.remove_if(key, |_, (_, expires_at)| now > *expires_at);
            debug!(key, "Shared store entry expired");
        }
        Ok(None)
    }

    async fn put(&self, key: &str, payload: String, ttl_seconds: u64) -> Result<(), KvError> {
        self.ensure_available()?;
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds.min(MAX_TTL_SECONDS));
        self.entries.insert(key.to_string(), (payload, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.ensure_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && now <= entry.value().1)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tier() -> (Arc<InMemoryKvStore>, SharedTier) {
        let store = Arc::new(InMemoryKvStore::new());
        let tier = SharedTier::new(store.clone());
        (store, tier)
    }

    #[tokio::test]
    async fn put_then_get() {
        let (_, tier) = tier();

        assert!(tier.put("content:item:1", &json!({ "title": "A" }), 60).await);
        assert_eq!(
            tier.get("content:item:1").await,
            Some(json!({ "title": "A" }))
        );
    }

    #[tokio::test]
    async fn expired_entry_is_dropped() {
        let (store, tier) = tier();
        let expired_at = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .expect("monotonic clock is past its first second");
        store
            .entries
            .insert("k:1".to_string(), ("1".to_string(), expired_at));

        assert!(tier.get("k:1").await.is_none());
        assert!(tier.list_by_prefix("k:").await.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let (_, tier) = tier();
        tier.put("content:list:a", &json!(1), 60).await;
        tier.put("content:item:1", &json!(2), 60).await;
        tier.put("user:id:1", &json!(3), 60).await;

        let keys = tier.list_by_prefix("content:").await;
        assert_eq!(keys, vec!["content:item:1", "content:list:a"]);
    }

    #[tokio::test]
    async fn failures_degrade_to_miss_and_no_op() {
        let (store, tier) = tier();
        tier.put("k", &json!(1), 60).await;

        store.set_unavailable(true);
        assert!(tier.get("k").await.is_none());
        assert!(!tier.put("k", &json!(2), 60).await);
        assert!(!tier.delete("k").await);
        assert!(tier.list_by_prefix("").await.is_empty());

        store.set_unavailable(false);
        assert_eq!(tier.get("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn undecodable_payload_reads_as_miss() {
        let (store, tier) = tier();
        store.put("k", "not json".to_string(), 60).await.expect("put");

        assert!(tier.get("k").await.is_none());
    }
}
