//! Event-driven invalidation table.
//!
//! `BINDINGS` lists, per domain event, what becomes stale. Keep every rule
//! in the table; `install` turns it into bus subscriptions.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::error::CacheError;
use super::events::{EventBus, EventRecord, EventStats, Subscription};
use super::glob::GlobPattern;
use super::keys::identifier_from_value;
use super::registry::CacheRegistry;
use super::service::CacheService;

/// Default number of entries returned by [`recent_invalidations`].
pub const DEFAULT_RECENT_LIMIT: usize = 50;

/// What a binding does to one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Delete `generate_key(key_type, payload[field])`; skipped when the
    /// payload has no usable `field`.
    ///
    /// The key carries the namespace version (`content:item:42:v1`), so an
    /// entry written under a hand-built key without the version suffix is
    /// not touched. Write item entries through `CacheService::generate_key`.
    Delete {
        namespace: &'static str,
        key_type: &'static str,
        field: &'static str,
    },
    /// Remove every key matching `pattern`.
    Invalidate {
        namespace: &'static str,
        pattern: &'static str,
    },
}

impl Action {
    pub fn namespace(&self) -> &'static str {
        match self {
            Action::Delete { namespace, .. } | Action::Invalidate { namespace, .. } => *namespace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub event: &'static str,
    pub actions: &'static [Action],
}

const fn delete(namespace: &'static str, key_type: &'static str, field: &'static str) -> Action {
    Action::Delete {
        namespace,
        key_type,
        field,
    }
}

const fn invalidate(namespace: &'static str, pattern: &'static str) -> Action {
    Action::Invalidate { namespace, pattern }
}

const USER_CHANGED: &[Action] = &[delete("user", "id", "id"), delete("user", "email", "email")];
const PLUGIN_CHANGED: &[Action] = &[
    invalidate("config", "config:*"),
    invalidate("plugin", "plugin:*"),
];
const MEDIA_CHANGED: &[Action] = &[
    delete("media", "item", "id"),
    invalidate("media", "media:list:*"),
];

pub const BINDINGS: &[Binding] = &[
    Binding {
        event: "content.create",
        actions: &[invalidate("content", "content:*"), invalidate("api", "api:*")],
    },
    Binding {
        event: "content.update",
        actions: &[
            delete("content", "item", "id"),
            invalidate("content", "content:list:*"),
            invalidate("api", "api:*"),
        ],
    },
    Binding {
        event: "content.delete",
        actions: &[
            delete("content", "item", "id"),
            invalidate("content", "content:*"),
            invalidate("api", "api:*"),
        ],
    },
    Binding {
        event: "content.publish",
        actions: &[invalidate("content", "content:*"), invalidate("api", "api:*")],
    },
    Binding {
        event: "user.update",
        actions: USER_CHANGED,
    },
    Binding {
        event: "user.delete",
        actions: USER_CHANGED,
    },
    Binding {
        event: "auth.login",
        actions: &[delete("user", "id", "userId")],
    },
    Binding {
        event: "auth.logout",
        actions: &[delete("session", "session", "sessionId")],
    },
    Binding {
        event: "config.update",
        actions: &[invalidate("config", "config:*")],
    },
    Binding {
        event: "plugin.activate",
        actions: PLUGIN_CHANGED,
    },
    Binding {
        event: "plugin.deactivate",
        actions: PLUGIN_CHANGED,
    },
    Binding {
        event: "plugin.update",
        actions: PLUGIN_CHANGED,
    },
    Binding {
        event: "media.upload",
        actions: &[invalidate("media", "media:*")],
    },
    Binding {
        event: "media.update",
        actions: MEDIA_CHANGED,
    },
    Binding {
        event: "media.delete",
        actions: MEDIA_CHANGED,
    },
    Binding {
        event: "collection.create",
        actions: &[invalidate("collection", "collection:*")],
    },
    Binding {
        event: "collection.update",
        actions: &[
            delete("collection", "item", "id"),
            invalidate("collection", "collection:*"),
            invalidate("api", "api:*"),
        ],
    },
    Binding {
        event: "collection.delete",
        actions: &[invalidate("collection", "collection:*")],
    },
];

enum Compiled {
    Delete {
        service: Arc<CacheService>,
        key_type: &'static str,
        field: &'static str,
    },
    Invalidate {
        service: Arc<CacheService>,
        pattern: GlobPattern,
    },
}

impl Compiled {
    async fn apply(&self, data: &Value) -> usize {
        match self {
            Compiled::Delete {
                service,
                key_type,
                field,
            } => {
                let Some(identifier) = data.get(*field).and_then(identifier_from_value) else {
                    return 0;
                };
                service
                    .delete(&service.generate_key(key_type, &identifier))
                    .await;
                1
            }
            Compiled::Invalidate { service, pattern } => service.invalidate_glob(pattern).await,
        }
    }
}

/// Live subscriptions created from [`BINDINGS`].
#[derive(Debug)]
pub struct InvalidationBindings {
    subscriptions: Vec<Subscription>,
}

impl InvalidationBindings {
    pub fn table() -> &'static [Binding] {
        BINDINGS
    }

    /// Subscribe every binding to `bus`, resolving services from `registry`.
    ///
    /// All patterns are compiled and all namespaces resolved before the
    /// first subscription, so a bad table fails without partial wiring.
    pub fn install(bus: &EventBus, registry: &CacheRegistry) -> Result<Self, CacheError> {
        let mut compiled = Vec::with_capacity(BINDINGS.len());
        for binding in BINDINGS {
            let mut actions = Vec::with_capacity(binding.actions.len());
            for action in binding.actions {
                let service = registry.service(action.namespace())?;
                actions.push(match *action {
                    Action::Delete {
                        key_type, field, ..
                    } => Compiled::Delete {
                        service,
                        key_type,
                        field,
                    },
                    Action::Invalidate { pattern, .. } => Compiled::Invalidate {
                        service,
                        pattern: GlobPattern::new(pattern)?,
                    },
                });
            }
            compiled.push((binding.event, Arc::new(actions)));
        }

        let subscriptions = compiled
            .into_iter()
            .map(|(event, actions)| {
                bus.on(event, move |data| {
                    let actions = Arc::clone(&actions);
                    async move {
                        let mut affected = 0;
                        for action in actions.iter() {
                            affected += action.apply(&data).await;
                        }
                        info!(event, affected, "Cache invalidated");
                        Ok(())
                    }
                })
            })
            .collect::<Vec<_>>();

        info!(count = subscriptions.len(), "Cache invalidation listeners registered");
        Ok(Self { subscriptions })
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Remove every subscription created by `install`.
    pub fn uninstall(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

/// Emit history as seen by the bus.
pub fn invalidation_stats(bus: &EventBus) -> EventStats {
    bus.get_stats()
}

/// The most recent `limit` events, oldest first.
pub fn recent_invalidations(bus: &EventBus, limit: usize) -> Vec<EventRecord> {
    bus.event_log(Some(limit))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::cache::config::BUILTIN_NAMESPACES;

    fn setup() -> (EventBus, CacheRegistry, InvalidationBindings) {
        let bus = EventBus::new();
        let registry = CacheRegistry::new(None);
        let bindings = InvalidationBindings::install(&bus, &registry).expect("bindings install");
        (bus, registry, bindings)
    }

    #[test]
    fn table_covers_every_event_once_and_known_namespaces() {
        let mut seen = HashSet::new();
        for binding in BINDINGS {
            assert!(seen.insert(binding.event), "duplicate {}", binding.event);
            for action in binding.actions {
                assert!(BUILTIN_NAMESPACES.contains(&action.namespace()));
                if let Action::Invalidate { namespace, pattern } = action {
                    assert!(pattern.starts_with(namespace));
                }
            }
        }
        assert_eq!(seen.len(), 18);
    }

    #[test]
    fn install_subscribes_each_event() {
        let (bus, _registry, bindings) = setup();
        assert_eq!(bindings.len(), BINDINGS.len());
        assert_eq!(bus.subscriber_count("content.update"), 1);

        bindings.uninstall();
        assert!(bus.events().is_empty());
    }

    #[tokio::test]
    async fn exact_delete_targets_versioned_key_only() {
        let (bus, registry, _bindings) = setup();
        let content = registry.service("content").expect("content");

        content.set("content:item:42:v1", &json!({ "title": "A" }), None).await;
        content.set("content:item:42", &json!({ "title": "A" }), None).await;

        bus.emit("content.update", json!({ "id": 42 })).await;

        assert!(!content.has("content:item:42:v1").await);
        assert!(content.has("content:item:42").await);
    }

    #[tokio::test]
    async fn content_update_deletes_item_and_lists() {
        let (bus, registry, _bindings) = setup();
        let content = registry.service("content").expect("content");
        let api = registry.service("api").expect("api");
        let user = registry.service("user").expect("user");

        let item = content.generate_key("item", "42");
        content.set(&item, &json!({ "title": "A" }), None).await;
        content.set("content:list:recent", &json!([42]), None).await;
        content.set("content:item:7:v1", &json!({ "title": "B" }), None).await;
        api.set("api:content:list", &json!([]), None).await;
        user.set("user:id:1", &json!({ "name": "u" }), None).await;

        bus.emit("content.update", json!({ "id": "42" })).await;

        assert!(!content.has(&item).await);
        assert!(!content.has("content:list:recent").await);
        assert!(content.has("content:item:7:v1").await);
        assert!(!api.has("api:content:list").await);
        assert!(user.has("user:id:1").await);
    }

    #[tokio::test]
    async fn numeric_identifiers_are_accepted() {
        let (bus, registry, _bindings) = setup();
        let media = registry.service("media").expect("media");
        let key = media.generate_key("item", "9");
        media.set(&key, &1, None).await;

        bus.emit("media.delete", json!({ "id": 9 })).await;

        assert!(!media.has(&key).await);
    }

    #[tokio::test]
    async fn user_update_without_email_only_deletes_id() {
        let (bus, registry, _bindings) = setup();
        let user = registry.service("user").expect("user");
        let by_id = user.generate_key("id", "1");
        let by_email = user.generate_key("email", "a@example.com");
        user.set(&by_id, &1, None).await;
        user.set(&by_email, &1, None).await;

        bus.emit("user.update", json!({ "id": "1" })).await;

        assert!(!user.has(&by_id).await);
        assert!(user.has(&by_email).await);
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let (bus, registry, _bindings) = setup();
        let session = registry.service("session").expect("session");
        let key = session.generate_key("session", "abc");
        session.set(&key, &json!({ "user": 1 }), None).await;

        bus.emit("auth.logout", json!({ "sessionId": "abc" })).await;

        assert!(!session.has(&key).await);
    }

    #[tokio::test]
    async fn plugin_update_purges_config_and_plugins() {
        let (bus, registry, _bindings) = setup();
        let config = registry.service("config").expect("config");
        let plugin = registry.service("plugin").expect("plugin");
        config.set("config:site", &1, None).await;
        plugin.set("plugin:list:all", &1, None).await;

        bus.emit("plugin.update", json!({ "pluginId": "seo" })).await;

        assert!(!config.has("config:site").await);
        assert!(!plugin.has("plugin:list:all").await);
    }

    #[tokio::test]
    async fn stats_and_recent_invalidations_follow_the_bus() {
        let (bus, _registry, _bindings) = setup();
        bus.emit("config.update", json!({})).await;
        bus.emit("media.upload", json!({})).await;
        bus.emit("media.upload", json!({})).await;

        let stats = invalidation_stats(&bus);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.event_counts["media.upload"], 2);

        let recent = recent_invalidations(&bus, 2);
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|record| record.event == "media.upload"));
    }
}
