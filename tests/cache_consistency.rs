//! End-to-end cache behavior: tiers, invalidation wiring and the event bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tiercache::cache::{
    CacheConfig, CacheRegistry, CacheService, EventBus, HandlerError, InMemoryKvStore,
    InvalidationBindings, KvStore, MemoryTier, SharedTier,
};

fn registry() -> (Arc<InMemoryKvStore>, CacheRegistry) {
    let store = Arc::new(InMemoryKvStore::new());
    let shared: Arc<dyn KvStore> = store.clone();
    (store, CacheRegistry::new(Some(shared)))
}

#[tokio::test]
async fn round_trip_through_both_tiers() {
    let (_store, registry) = registry();
    let content = registry.service("content").expect("content");

    for (n, value) in [json!("text"), json!(42), json!({ "nested": [1, 2] })]
        .into_iter()
        .enumerate()
    {
        let key = content.generate_key("item", &n.to_string());
        content.set(&key, &value, None).await;
        assert_eq!(content.get::<Value>(&key).await, Some(value));
    }
}

#[tokio::test]
async fn expired_entries_disappear() {
    let (_store, registry) = registry();
    let service = registry.get_cache_service(CacheConfig {
        ttl_seconds: 1,
        ..CacheConfig::new("short")
    });

    service.set("short:item:1", "v", None).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(service.get::<String>("short:item:1").await.is_none());
    assert!(service.list_keys().iter().all(|info| info.key != "short:item:1"));
}

#[tokio::test]
async fn namespace_isolation() {
    let (store, registry) = registry();
    let content = registry.service("content").expect("content");
    let user = registry.service("user").expect("user");

    content.set("content:item:1", &1, None).await;
    user.set("user:id:1", &1, None).await;
    user.set("user:content:1", &1, None).await;

    content.invalidate("content:*").await.expect("valid glob");

    assert!(user.has("user:id:1").await);
    assert!(user.has("user:content:1").await);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn pattern_precision() {
    let service = CacheService::new(
        CacheConfig {
            kv_enabled: false,
            ..CacheConfig::for_namespace("content")
        },
        None,
    );
    for key in ["content:list:a", "content:list:b", "content:item:1"] {
        service.set(key, &json!({ "k": key }), None).await;
    }

    let removed = service.invalidate("content:list:*").await.expect("valid glob");

    assert_eq!(removed, 2);
    assert!(service.has("content:item:1").await);
    assert!(!service.has("content:list:a").await);
}

#[tokio::test]
async fn eviction_keeps_size_within_budget() {
    let budget = 2_000;
    let service = CacheService::with_memory_tier(
        CacheConfig {
            kv_enabled: false,
            ..CacheConfig::new("evict")
        },
        None,
        MemoryTier::with_budget(budget),
    );

    for n in 0..40 {
        service
            .set(&format!("evict:item:{n}"), &"x".repeat(50), None)
            .await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(service.get_stats().memory_size <= budget);
    }

    assert!(!service.has("evict:item:0").await);
    assert!(service.has("evict:item:39").await);
    let stats = service.get_stats();
    assert!(stats.entry_count < 40);
}

#[tokio::test]
async fn handler_isolation() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let recorded = calls.clone();
    let _h1 = bus.on("e", move |_| {
        let recorded = recorded.clone();
        async move {
            recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let _h2 = bus.on("e", |_| async { Err(HandlerError::failed("always fails")) });

    bus.emit("e", json!({})).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsubscribe_twice_is_harmless() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let recorded = calls.clone();
    let subscription = bus.on("e", move |_| {
        let recorded = recorded.clone();
        async move {
            recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    subscription.unsubscribe();
    subscription.unsubscribe();
    bus.emit("e", json!({})).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(bus.subscriber_count("e"), 0);
}

#[tokio::test]
async fn cache_aside_fetches_once() {
    let (_store, registry) = registry();
    let content = registry.service("content").expect("content");
    let fetches = AtomicUsize::new(0);
    let counter = &fetches;
    let fetch = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>(json!({ "title": "A" }))
    };

    let first: Value = content
        .get_or_set("content:item:42", fetch, None)
        .await
        .expect("fetch succeeds");
    let second: Value = content
        .get_or_set("content:item:42", fetch, None)
        .await
        .expect("cached");

    assert_eq!(first, json!({ "title": "A" }));
    assert_eq!(second, json!({ "title": "A" }));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn content_update_invalidates_item_and_lists() {
    let (store, registry) = registry();
    let bus = EventBus::new();
    let _bindings = InvalidationBindings::install(&bus, &registry).expect("bindings");

    let content = registry.service("content").expect("content");
    let user = registry.service("user").expect("user");
    let item = content.generate_key("item", "42");
    content.set(&item, &json!({ "title": "A" }), None).await;
    content.set("content:list:recent", &json!([42]), None).await;
    content.set("content:list:popular", &json!([42]), None).await;
    user.set("user:id:1", &json!({ "name": "u" }), None).await;

    bus.emit("content.update", json!({ "id": "42" })).await;

    assert!(content.get::<Value>(&item).await.is_none());
    assert!(content.get::<Value>("content:list:recent").await.is_none());
    assert!(content.get::<Value>("content:list:popular").await.is_none());
    assert_eq!(
        user.get::<Value>("user:id:1").await,
        Some(json!({ "name": "u" }))
    );
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn shared_tier_outage_degrades_to_memory() {
    let store = Arc::new(InMemoryKvStore::new());
    let service = CacheService::new(
        CacheConfig::new("outage"),
        Some(SharedTier::new(store.clone())),
    );
    store.set_unavailable(true);

    service.set("outage:item:1", &1, None).await;
    assert_eq!(service.get::<i32>("outage:item:1").await, Some(1));
    assert_eq!(service.invalidate("outage:*").await.expect("glob"), 1);
    assert!(service.get::<i32>("outage:item:1").await.is_none());
}

#[tokio::test]
async fn second_instance_sees_shared_writes() {
    let store = Arc::new(InMemoryKvStore::new());
    let writer = CacheService::new(
        CacheConfig::new("shared"),
        Some(SharedTier::new(store.clone())),
    );
    let reader = CacheService::new(CacheConfig::new("shared"), Some(SharedTier::new(store)));

    writer.set("shared:item:1", &json!("hello"), None).await;

    let result = reader.get_with_source::<Value>("shared:item:1").await;
    assert!(result.hit);
    assert_eq!(result.data, Some(json!("hello")));
    assert_eq!(reader.get_stats().kv_hits, 1);
}
