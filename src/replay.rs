//! Scenario replay for the `tiercache replay` command.
//!
//! A scenario seeds a fresh registry, emits domain events through the
//! installed invalidation bindings and reports what is left in memory.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::cache::{
    CacheRegistry, CacheStats, DEFAULT_RECENT_LIMIT, EventBus, EventRecord, EventStats,
    InMemoryKvStore, InvalidationBindings, KvStore, invalidation_stats, recent_invalidations,
};
use crate::config::{Settings, SharedStoreKind};
use crate::infra::error::InfraError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub seed: Vec<SeedRow>,
    pub events: Vec<EventRow>,
}

/// A value to store before any event runs.
///
/// Give either a full `key` or a `key_type`/`id` pair, which is turned into
/// a key with the namespace's version.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedRow {
    pub namespace: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRow {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub seeded: usize,
    pub events: EventStats,
    /// Latest emitted events, oldest first.
    pub recent: Vec<EventRecord>,
    /// Live memory-tier keys per namespace after all events.
    pub remaining: BTreeMap<String, Vec<String>>,
    pub stats: BTreeMap<String, CacheStats>,
}

impl Scenario {
    pub fn parse(text: &str) -> Result<Self, InfraError> {
        toml::from_str(text)
            .map_err(|err| InfraError::scenario(format!("failed to parse scenario: {err}")))
    }

    pub async fn load(path: &Path) -> Result<Self, InfraError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }
}

/// Registry configured from settings, with a fresh shared store.
pub fn registry_from_settings(settings: &Settings) -> CacheRegistry {
    let shared: Option<Arc<dyn KvStore>> = match settings.cache.shared_store {
        SharedStoreKind::None => None,
        SharedStoreKind::Memory => Some(Arc::new(InMemoryKvStore::new())),
    };

    CacheRegistry::new(shared)
        .with_policies(settings.namespaces.values().cloned())
        .with_memory_budget(settings.cache.memory_budget_bytes.get())
}

pub async fn replay(settings: &Settings, scenario: &Scenario) -> Result<ReplayReport, InfraError> {
    let registry = registry_from_settings(settings);
    let bus = EventBus::with_capacity(settings.cache.event_log_capacity.get());
    let _bindings = InvalidationBindings::install(&bus, &registry)?;

    for row in &scenario.seed {
        let service = registry.service(&row.namespace)?;
        let key = match (&row.key, &row.key_type, &row.id) {
            (Some(key), _, _) => key.clone(),
            (None, Some(key_type), Some(id)) => service.generate_key(key_type, id),
            _ => {
                return Err(InfraError::scenario(format!(
                    "seed row in `{}` needs `key` or both `key_type` and `id`",
                    row.namespace
                )));
            }
        };
        service.set(&key, &row.value, None).await;
    }
    info!(rows = scenario.seed.len(), "Scenario seeded");

    for event in &scenario.events {
        bus.emit(&event.name, event.payload.clone()).await;
    }

    let stats = registry.all_stats();
    let mut remaining = BTreeMap::new();
    for namespace in stats.keys() {
        let service = registry.service(namespace)?;
        let keys = service.list_keys().into_iter().map(|info| info.key).collect();
        remaining.insert(namespace.clone(), keys);
    }

    Ok(ReplayReport {
        seeded: scenario.seed.len(),
        events: invalidation_stats(&bus),
        recent: recent_invalidations(&bus, DEFAULT_RECENT_LIMIT),
        remaining,
        stats,
    })
}
