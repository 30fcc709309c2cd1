//! End-to-end cache behavior through the public facade: the
//! stale-while-revalidate lifecycle, event-driven invalidation, and
//! degraded-mode fallbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dispensa::{
    CacheConfig, CacheEntry, ContentCache, RevalidationSettings, WebhookPayload, fetch_fn,
};
use serde_json::{Value, json};
use time::OffsetDateTime;

fn fast_cache() -> ContentCache {
    let mut config = CacheConfig::default();
    config.ttl.insert("posts".to_string(), 2);
    config.revalidation = RevalidationSettings {
        busy_interval_ms: 20,
        idle_interval_ms: 50,
        ..Default::default()
    };
    ContentCache::new(config).expect("cache config")
}

/// Fetcher that returns `{"version": n}` for its n-th call.
fn versioned_fetch() -> (Arc<dyn dispensa::Fetch>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let fetch = fetch_fn(move || {
        let version = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(json!({"version": version})) }
    });
    (fetch, calls)
}

#[tokio::test]
async fn stale_while_revalidate_lifecycle() {
    let cache = fast_cache();
    cache.start().await;
    let (fetch, calls) = versioned_fetch();

    // cold miss fetches inline
    let first = cache
        .get_with_revalidate("posts:all", Arc::clone(&fetch), None)
        .await
        .expect("inline fetch");
    assert_eq!(first, json!({"version": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // past half the 2s TTL: still served the old value instantly
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let second = cache
        .get_with_revalidate("posts:all", Arc::clone(&fetch), None)
        .await
        .expect("stale hit");
    assert_eq!(second, json!({"version": 1}));

    // the scheduler refreshes in the background
    tokio::time::sleep(Duration::from_millis(300)).await;
    let third = cache
        .get_with_revalidate("posts:all", fetch, None)
        .await
        .expect("refreshed hit");
    assert_eq!(third, json!({"version": 2}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    cache.close().await;
}

#[tokio::test]
async fn post_event_invalidates_post_listings_and_sitemap() {
    let cache = ContentCache::new(CacheConfig::default()).expect("cache config");
    cache.set("post:hello", json!({"slug": "hello"}), None).await;
    cache.set("posts:all", json!(["hello"]), None).await;
    cache.set("posts:page=2", json!(["older"]), None).await;
    cache.set("categories:all", json!(["rust"]), None).await;
    cache.set("sitemap:xml", json!("<xml/>"), None).await;

    let outcome = cache
        .apply_event(&WebhookPayload {
            event_type: "post.updated".to_string(),
            data: json!({"slug": "hello"}),
        })
        .await;

    assert_eq!(outcome.patterns, ["post:hello", "posts:*", "sitemap:*"]);
    assert_eq!(outcome.removed, 4);
    assert_eq!(cache.get("post:hello").await, None);
    assert_eq!(cache.get("posts:all").await, None);
    assert_eq!(cache.get("posts:page=2").await, None);
    assert_eq!(cache.get("sitemap:xml").await, None);
    // categories are untouched by post events
    assert_eq!(cache.get("categories:all").await, Some(json!(["rust"])));
}

#[tokio::test]
async fn bulk_update_flushes_the_whole_cache() {
    let cache = ContentCache::new(CacheConfig::default()).expect("cache config");
    cache.set("post:a", json!(1), None).await;
    cache.set("categories:all", json!(2), None).await;

    let outcome = cache
        .apply_event(&WebhookPayload {
            event_type: "bulk.update".to_string(),
            data: Value::Null,
        })
        .await;

    assert_eq!(outcome.patterns, ["*"]);
    assert_eq!(outcome.removed, 2);
    assert!(cache.store().is_empty());
}

#[tokio::test]
async fn unknown_event_invalidates_nothing() {
    let cache = ContentCache::new(CacheConfig::default()).expect("cache config");
    cache.set("post:a", json!(1), None).await;

    let outcome = cache
        .apply_event(&WebhookPayload {
            event_type: "media.uploaded".to_string(),
            data: Value::Null,
        })
        .await;

    assert!(outcome.patterns.is_empty());
    assert_eq!(outcome.removed, 0);
    assert_eq!(cache.get("post:a").await, Some(json!(1)));
}

#[tokio::test]
async fn fetch_failure_serves_the_last_known_value() {
    let cache = ContentCache::new(CacheConfig::default()).expect("cache config");

    // an expired copy is still resident
    cache.store().insert_entry(
        CacheEntry::new("posts:all", json!(["archived"]), Duration::from_secs(1), 0)
            .with_created_at(OffsetDateTime::now_utc() - Duration::from_secs(60)),
    );

    let fetch = fetch_fn(|| async { Err::<Value, dispensa::BoxError>("upstream 503".into()) });
    let served = cache
        .get_with_revalidate("posts:all", fetch, None)
        .await
        .expect("stale fallback");
    assert_eq!(served, json!(["archived"]));
}

#[tokio::test]
async fn metrics_track_the_full_lifecycle() {
    let cache = ContentCache::new(CacheConfig::default()).expect("cache config");

    cache.set("posts:all", json!(1), None).await;
    cache.get("posts:all").await;
    cache.get("posts:missing").await;
    cache.invalidate("posts:*").await;

    let snapshot = cache.snapshot();
    assert_eq!(snapshot.sets, 1);
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.misses, 1);
    assert_eq!(snapshot.invalidations, 1);
    assert!((snapshot.hit_rate - 0.5).abs() < f64::EPSILON);
}
