//! The cache facade: tiered reads, stale-while-revalidate, event-driven
//! invalidation, and the operator surface, behind one handle.
//!
//! Read path for [`ContentCache::get_with_revalidate`]:
//! fresh hit -> serve; stale hit -> serve and queue a background refresh;
//! miss -> fetch inline and store; fetch failure -> serve the most recent
//! expired copy if one is still resident, else surface the error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::external::{ExternalTier, RedisTier};
use crate::metrics::{CacheHealth, MetricsCollector, MetricsSnapshot, describe_metrics};
use crate::revalidate::{Fetch, Priority, RevalidationQueue, RevalidationScheduler};
use crate::router::{InvalidationOutcome, InvalidationRouter};
use crate::store::{CacheEntryStore, InspectReport};
use crate::webhook::WebhookPayload;

/// Content API cache handle. Cheap to clone via the inner `Arc`s; one
/// instance per process is the expected shape.
pub struct ContentCache {
    config: CacheConfig,
    store: Arc<CacheEntryStore>,
    queue: Arc<RevalidationQueue>,
    scheduler: Arc<RevalidationScheduler>,
    router: InvalidationRouter,
    metrics: Arc<MetricsCollector>,
}

impl ContentCache {
    /// Build a cache from validated configuration. The external tier is
    /// wired when enabled; its connections are established lazily.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        describe_metrics();

        let metrics = Arc::new(MetricsCollector::new(config.metrics.enabled));
        let external: Option<Arc<dyn ExternalTier>> = if config.external.enabled {
            let url = config.external.url.as_deref().unwrap_or_default();
            let tier = RedisTier::connect(url, config.external.key_prefix.clone())
                .map_err(CacheError::Store)?;
            Some(Arc::new(tier))
        } else {
            None
        };

        let store = Arc::new(CacheEntryStore::new(
            config.clone(),
            external,
            Arc::clone(&metrics),
        ));
        let queue = Arc::new(RevalidationQueue::new(config.revalidation.max_attempts));
        let scheduler = Arc::new(RevalidationScheduler::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&metrics),
            config.revalidation.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue,
            scheduler,
            router: InvalidationRouter::with_default_rules(),
            metrics,
        })
    }

    /// Start background work: the revalidation scheduler, plus an
    /// external-tier probe when one is configured.
    pub async fn start(&self) {
        self.scheduler.start();
        if self.store.external_enabled() {
            let connected = self.store.probe_external().await;
            info!(connected, "external tier probe");
        }
    }

    /// Stop background work. The cache remains usable for direct reads
    /// and writes afterwards.
    pub async fn close(&self) {
        self.scheduler.close().await;
    }

    // ========================================================================
    // Read/write surface
    // ========================================================================

    /// Plain tiered lookup without revalidation.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let started = Instant::now();
        let entry = self.store.get(key).await;
        self.metrics.record_timing("get", started.elapsed());
        entry.map(|entry| entry.data)
    }

    /// Store a value under a key. TTL defaults to the content-type table.
    pub async fn set(&self, key: &str, data: Value, ttl: Option<Duration>) {
        let started = Instant::now();
        self.store.set(key, data, ttl).await;
        self.metrics.record_timing("set", started.elapsed());
    }

    /// Pre-populate the cache from key/fetcher pairs, typically at
    /// startup. A route whose fetch fails is logged and skipped; the
    /// rest still warm. Returns the number of entries written.
    pub async fn warm(&self, routes: Vec<(String, Arc<dyn Fetch>)>) -> usize {
        let mut warmed = 0;
        for (key, fetch) in routes {
            match fetch.fetch().await {
                Ok(value) => {
                    self.store.set(&key, value, None).await;
                    warmed += 1;
                }
                Err(err) => {
                    self.metrics.record_error("warm");
                    warn!(%key, error = %err, "cache warm failed for route");
                }
            }
        }
        info!(warmed, "cache warm complete");
        warmed
    }

    /// Tiered lookup with stale-while-revalidate semantics. `fetch` is
    /// the authoritative producer for the key; it runs inline on a miss
    /// and in the background once a hit turns stale.
    pub async fn get_with_revalidate(
        &self,
        key: &str,
        fetch: Arc<dyn Fetch>,
        ttl: Option<Duration>,
    ) -> Result<Value, CacheError> {
        let started = Instant::now();

        if let Some(entry) = self.store.get(key).await {
            if entry.is_stale() {
                self.queue
                    .enqueue(key, fetch, Priority::Medium, entry.generation, ttl);
            }
            self.metrics.record_timing("get", started.elapsed());
            return Ok(entry.data);
        }

        match fetch.fetch().await {
            Ok(value) => {
                self.store.set(key, value.clone(), ttl).await;
                self.metrics.record_timing("fetch", started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.metrics.record_error("fetch");
                if let Some(stale) = self.store.get_stale(key) {
                    warn!(key, error = %err, "fetch failed, serving last known value");
                    return Ok(stale.data);
                }
                Err(CacheError::Fetch {
                    key: key.to_string(),
                    source: err,
                })
            }
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Remove an exact key or a `*` pattern across both tiers.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        self.store.invalidate(pattern).await
    }

    /// Route a content event to its invalidation patterns and apply them.
    pub async fn apply_event(&self, payload: &WebhookPayload) -> InvalidationOutcome {
        let patterns = self.router.patterns_for(payload);
        let mut removed = 0;
        for pattern in &patterns {
            removed += self.store.invalidate(pattern).await;
        }
        info!(
            event = %payload.event_type,
            patterns = patterns.len(),
            removed,
            "webhook invalidation applied"
        );
        InvalidationOutcome { patterns, removed }
    }

    /// Empty both tiers.
    pub async fn clear(&self) {
        self.store.clear().await;
    }

    // ========================================================================
    // Operator surface
    // ========================================================================

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn inspect(&self) -> InspectReport {
        self.store.inspect().await
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth::from_snapshot(self.metrics.snapshot(), self.store.external_enabled())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheEntryStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<RevalidationQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<RevalidationScheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }
}
