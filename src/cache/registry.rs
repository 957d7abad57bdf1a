//! Namespace registry.
//!
//! Owns the one `CacheService` per namespace. Build a registry once at
//! startup and hand `Arc<CacheRegistry>` to whatever needs a cache; tests
//! build their own.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::info;

use super::config::{BUILTIN_NAMESPACES, CacheConfig};
use super::error::CacheError;
use super::lock::{rw_read, rw_write};
use super::memory::{DEFAULT_MEMORY_BUDGET_BYTES, MemoryTier};
use super::service::{CacheService, CacheStats};
use super::shared::{KvStore, SharedTier};

const SOURCE: &str = "cache::registry";

pub struct CacheRegistry {
    shared: Option<Arc<dyn KvStore>>,
    policies: HashMap<String, CacheConfig>,
    memory_budget: usize,
    services: RwLock<HashMap<String, Arc<CacheService>>>,
}

impl CacheRegistry {
    /// Registry with the built-in namespace policies.
    pub fn new(shared: Option<Arc<dyn KvStore>>) -> Self {
        let policies = BUILTIN_NAMESPACES
            .iter()
            .map(|namespace| (namespace.to_string(), CacheConfig::for_namespace(namespace)))
            .collect();

        Self {
            shared,
            policies,
            memory_budget: DEFAULT_MEMORY_BUDGET_BYTES,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Replace or add namespace policies.
    pub fn with_policies(mut self, policies: impl IntoIterator<Item = CacheConfig>) -> Self {
        for policy in policies {
            self.policies.insert(policy.namespace.clone(), policy);
        }
        self
    }

    /// Byte budget given to each namespace's memory tier.
    pub fn with_memory_budget(mut self, budget: usize) -> Self {
        self.memory_budget = budget;
        self
    }

    pub fn memory_budget(&self) -> usize {
        self.memory_budget
    }

    pub fn policy(&self, namespace: &str) -> Option<&CacheConfig> {
        self.policies.get(namespace)
    }

    /// Service for `config.namespace`, created on first use.
    ///
    /// Once a namespace has a service, later calls return it unchanged even
    /// if `config` differs.
    pub fn get_cache_service(&self, config: CacheConfig) -> Arc<CacheService> {
        if let Some(existing) =
            rw_read(&self.services, SOURCE, "get_cache_service").get(&config.namespace)
        {
            return Arc::clone(existing);
        }

        let mut services = rw_write(&self.services, SOURCE, "get_cache_service.create");
        let namespace = config.namespace.clone();
        let service = services.entry(namespace.clone()).or_insert_with(|| {
            let shared = self.shared.clone().map(SharedTier::new);
            info!(
                namespace = %namespace,
                ttl_seconds = config.ttl_seconds,
                memory_enabled = config.memory_enabled,
                kv_enabled = config.kv_enabled && shared.is_some(),
                "Cache service created"
            );
            Arc::new(CacheService::with_memory_tier(
                config,
                shared,
                MemoryTier::with_budget(self.memory_budget),
            ))
        });
        Arc::clone(service)
    }

    /// Service for a namespace with a configured policy or an existing
    /// instance.
    pub fn service(&self, namespace: &str) -> Result<Arc<CacheService>, CacheError> {
        if let Some(existing) = rw_read(&self.services, SOURCE, "service").get(namespace) {
            return Ok(Arc::clone(existing));
        }
        let policy = self
            .policies
            .get(namespace)
            .cloned()
            .ok_or_else(|| CacheError::unknown_namespace(namespace))?;
        Ok(self.get_cache_service(policy))
    }

    /// Namespaces with a policy or a live service, sorted.
    pub fn known_namespaces(&self) -> Vec<String> {
        let services = rw_read(&self.services, SOURCE, "known_namespaces");
        let mut names: Vec<String> = self
            .policies
            .keys()
            .chain(services.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Policies in effect, including ones of live services without a
    /// configured policy.
    pub fn policies(&self) -> BTreeMap<String, CacheConfig> {
        let mut policies: BTreeMap<String, CacheConfig> = self
            .policies
            .iter()
            .map(|(name, policy)| (name.clone(), policy.clone()))
            .collect();
        for (name, service) in rw_read(&self.services, SOURCE, "policies").iter() {
            policies.insert(name.clone(), service.config().clone());
        }
        policies
    }

    /// Clear the memory tier and stats of every live service.
    pub fn clear_all(&self) {
        let services = rw_read(&self.services, SOURCE, "clear_all");
        for service in services.values() {
            service.clear();
        }
        info!(count = services.len(), "All cache namespaces cleared");
    }

    pub fn all_stats(&self) -> BTreeMap<String, CacheStats> {
        rw_read(&self.services, SOURCE, "all_stats")
            .iter()
            .map(|(name, service)| (name.clone(), service.get_stats()))
            .collect()
    }

    /// Clear and drop every service. Handles held elsewhere keep working
    /// but are no longer returned by the registry.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<CacheService>> = rw_write(&self.services, SOURCE, "shutdown")
            .drain()
            .map(|(_, service)| service)
            .collect();
        for service in &drained {
            service.clear();
        }
        info!(count = drained.len(), "Cache registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::shared::InMemoryKvStore;

    #[test]
    fn one_instance_per_namespace() {
        let registry = CacheRegistry::new(None);
        let first = registry.get_cache_service(CacheConfig::for_namespace("content"));
        let second = registry.get_cache_service(CacheConfig {
            ttl_seconds: 1,
            ..CacheConfig::for_namespace("content")
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().ttl_seconds, 3600);
    }

    #[test]
    fn registries_are_isolated() {
        let a = CacheRegistry::new(None);
        let b = CacheRegistry::new(None);

        let from_a = a.service("content").expect("builtin");
        let from_b = b.service("content").expect("builtin");
        assert!(!Arc::ptr_eq(&from_a, &from_b));
    }

    #[test]
    fn unknown_namespace_is_an_error() {
        let registry = CacheRegistry::new(None);
        let error = registry.service("reports").expect_err("no policy");
        assert!(matches!(error, CacheError::UnknownNamespace(name) if name == "reports"));

        registry.get_cache_service(CacheConfig::new("reports"));
        assert!(registry.service("reports").is_ok());
    }

    #[test]
    fn configured_policy_replaces_builtin() {
        let registry = CacheRegistry::new(None).with_policies([CacheConfig {
            ttl_seconds: 42,
            ..CacheConfig::for_namespace("api")
        }]);

        assert_eq!(registry.service("api").expect("api").config().ttl_seconds, 42);
        assert_eq!(registry.known_namespaces().len(), BUILTIN_NAMESPACES.len());
    }

    #[test]
    fn memory_budget_is_applied() {
        let registry = CacheRegistry::new(None).with_memory_budget(1024);
        assert_eq!(registry.memory_budget(), 1024);
    }

    #[tokio::test]
    async fn clear_all_and_stats() {
        let registry = CacheRegistry::new(Some(Arc::new(InMemoryKvStore::new())));
        let content = registry.service("content").expect("content");
        let user = registry.service("user").expect("user");

        content.set("content:item:1", &1, None).await;
        user.set("user:id:1", &1, None).await;
        content.get::<i32>("content:item:1").await;

        let stats = registry.all_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["content"].memory_hits, 1);
        assert_eq!(stats["user"].entry_count, 1);

        registry.clear_all();
        assert_eq!(registry.all_stats()["user"].entry_count, 0);
    }

    #[test]
    fn shutdown_drops_services() {
        let registry = CacheRegistry::new(None);
        let before = registry.service("media").expect("media");
        registry.shutdown();

        assert!(registry.all_stats().is_empty());
        let after = registry.service("media").expect("media");
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
