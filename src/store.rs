//! Two-tier cache entry storage.
//!
//! Local tier: in-process LRU map, checked first, no I/O. External tier:
//! optional shared store, checked on local miss; hits are promoted into
//! the local tier with their remaining TTL. External faults never reach
//! callers; the store degrades to local-only behavior.
//!
//! Expired entries stay resident in the local tier until a capacity sweep
//! removes them. That is deliberate: they are the "most recent value"
//! served when a fetch fails or the cache layer itself errors.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::external::ExternalTier;
use crate::keys::{content_type_of, pattern_matches};
use crate::lock::{rw_read, rw_write};
use crate::metrics::MetricsCollector;

const SOURCE: &str = "store";

/// Two-tier key/value storage for cache entries.
///
/// Owns entry lifecycle: creation on write, hit-count mutation on read,
/// destruction on expiry sweep, invalidation, or LRU eviction.
pub struct CacheEntryStore {
    config: CacheConfig,
    local: RwLock<LruCache<String, CacheEntry>>,
    external: Option<Arc<dyn ExternalTier>>,
    metrics: Arc<MetricsCollector>,
    generation: AtomicU64,
}

impl CacheEntryStore {
    pub fn new(
        config: CacheConfig,
        external: Option<Arc<dyn ExternalTier>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let capacity = config.max_entries_non_zero();
        Self {
            config,
            local: RwLock::new(LruCache::new(capacity)),
            external,
            metrics,
            generation: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up a key: local tier first, then the external tier with
    /// promotion. Expired copies count as misses (but stay resident for
    /// `get_stale`). Increments the hit or miss counter accordingly.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.local_fresh(key) {
            self.metrics.record_hit("local");
            debug!(key, tier = "local", outcome = "hit", "cache lookup");
            return Some(entry);
        }

        if let Some(entry) = self.external_fresh(key).await {
            self.metrics.record_hit("external");
            debug!(key, tier = "external", outcome = "hit", "cache lookup");
            return Some(entry);
        }

        self.metrics.record_miss();
        debug!(key, outcome = "miss", "cache lookup");
        None
    }

    /// Most recent resident copy of a key, expired or not. Used as the
    /// fallback when a fetch or the cache layer itself fails. Local tier
    /// only; does not touch hit/miss counters.
    pub fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        let mut local = rw_write(&self.local, SOURCE, "get_stale");
        local.get_mut(key).map(|entry| {
            entry.hit_count += 1;
            entry.clone()
        })
    }

    fn local_fresh(&self, key: &str) -> Option<CacheEntry> {
        let mut local = rw_write(&self.local, SOURCE, "get.local");
        match local.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.hit_count += 1;
                Some(entry.clone())
            }
            // expired copies stay resident until swept
            _ => None,
        }
    }

    async fn external_fresh(&self, key: &str) -> Option<CacheEntry> {
        let external = self.external.as_ref()?;
        match external.fetch(key).await {
            Ok(Some(payload)) => {
                self.metrics.set_external_connected(true);
                match serde_json::from_str::<CacheEntry>(&payload) {
                    Ok(mut entry) if !entry.is_expired() => {
                        entry.hit_count += 1;
                        // created_at travels with the entry, so promotion
                        // keeps the remaining TTL and staleness intact
                        self.insert_local(entry.clone());
                        Some(entry)
                    }
                    Ok(_) => None,
                    Err(err) => {
                        warn!(key, error = %err, "external tier payload unreadable, ignoring");
                        self.metrics.record_error("store");
                        None
                    }
                }
            }
            Ok(None) => {
                self.metrics.set_external_connected(true);
                None
            }
            Err(err) => {
                warn!(key, error = %err, "external tier read failed, local tier only");
                self.metrics.record_error("store");
                self.metrics.set_external_connected(false);
                None
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a value. Effective TTL: explicit argument, else the
    /// content-type table keyed by the prefix before the first `:`, else
    /// the default. The local write always succeeds; the external write
    /// is best-effort.
    pub async fn set(&self, key: &str, data: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(content_type_of(key)));
        let entry = CacheEntry::new(key, data, ttl, self.next_generation());
        self.insert_local(entry.clone());
        self.write_external(&entry).await;
        self.metrics.record_set();
        debug!(key, ttl_secs = entry.ttl_seconds, "cache set");
    }

    /// Generation-fenced write used by background revalidation. The
    /// result is discarded when the resident entry was invalidated,
    /// evicted, or rewritten since the generation was captured; the
    /// later writer wins.
    pub async fn set_if_current(
        &self,
        key: &str,
        data: Value,
        ttl: Option<Duration>,
        expected_generation: u64,
    ) -> bool {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(content_type_of(key)));
        let entry = CacheEntry::new(key, data, ttl, self.next_generation());
        {
            let mut local = rw_write(&self.local, SOURCE, "set_if_current");
            match local.peek(key) {
                Some(current) if current.generation == expected_generation => {
                    local.put(key.to_string(), entry.clone());
                }
                _ => {
                    debug!(key, expected_generation, "refresh result superseded, discarding");
                    return false;
                }
            }
        }
        self.write_external(&entry).await;
        self.metrics.record_set();
        debug!(key, ttl_secs = entry.ttl_seconds, "cache refreshed");
        true
    }

    /// Insert a pre-built entry into the local tier only. Promotion and
    /// freshness-sensitive tests go through this.
    pub fn insert_entry(&self, entry: CacheEntry) {
        self.insert_local(entry);
    }

    fn insert_local(&self, entry: CacheEntry) {
        let mut local = rw_write(&self.local, SOURCE, "insert_local");

        // sweep expired entries before admitting a new key at capacity
        if local.len() >= local.cap().get() && !local.contains(&entry.key) {
            let expired: Vec<String> = local
                .iter()
                .filter(|(_, resident)| resident.is_expired())
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                local.pop(key);
            }
            if !expired.is_empty() {
                debug!(swept = expired.len(), "expired entries swept before admit");
            }
        }

        let key = entry.key.clone();
        if let Some((evicted_key, _)) = local.push(key.clone(), entry) {
            if evicted_key != key {
                self.metrics.record_eviction();
                debug!(key = %evicted_key, "local tier eviction under capacity pressure");
            }
        }
    }

    async fn write_external(&self, entry: &CacheEntry) {
        let Some(external) = &self.external else {
            return;
        };
        let payload = match serde_json::to_string(entry) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key = %entry.key, error = %err, "cache entry serialization failed");
                self.metrics.record_error("store");
                return;
            }
        };
        let ttl = entry.remaining_ttl().max(Duration::from_secs(1));
        match external.store(&entry.key, &payload, ttl).await {
            Ok(()) => self.metrics.set_external_connected(true),
            Err(err) => {
                warn!(key = %entry.key, error = %err, "external tier write failed, local tier only");
                self.metrics.record_error("store");
                self.metrics.set_external_connected(false);
            }
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Delete an exact key or every key matching a `*` pattern, across
    /// both tiers. Returns the number of entries removed. External-tier
    /// failures leave the local deletion in effect.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        let removed = if pattern.contains('*') {
            self.invalidate_pattern(pattern).await
        } else {
            self.invalidate_exact(pattern).await
        };
        self.metrics.record_invalidations(removed);
        info!(pattern, removed, "cache invalidation");
        removed
    }

    async fn invalidate_exact(&self, key: &str) -> u64 {
        let local_removed = rw_write(&self.local, SOURCE, "invalidate_exact")
            .pop(key)
            .is_some();

        let mut external_removed = 0;
        if let Some(external) = &self.external {
            match external.remove(key).await {
                Ok(count) => external_removed = count,
                Err(err) => {
                    warn!(key, error = %err, "external tier delete failed, tiers may diverge until expiry");
                    self.metrics.record_error("store");
                    self.metrics.set_external_connected(false);
                }
            }
        }

        u64::from(local_removed || external_removed > 0)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let mut removed = {
            let mut local = rw_write(&self.local, SOURCE, "invalidate_pattern");
            let matching: Vec<String> = local
                .iter()
                .filter(|(key, _)| pattern_matches(pattern, key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &matching {
                local.pop(key);
            }
            matching.len() as u64
        };

        if let Some(external) = &self.external {
            match external.remove_matching(pattern).await {
                Ok(count) => removed += count,
                Err(err) => {
                    warn!(pattern, error = %err, "external tier pattern delete failed, tiers may diverge until expiry");
                    self.metrics.record_error("store");
                    self.metrics.set_external_connected(false);
                }
            }
        }

        removed
    }

    /// Empty both tiers unconditionally.
    pub async fn clear(&self) {
        rw_write(&self.local, SOURCE, "clear").clear();
        if let Some(external) = &self.external {
            if let Err(err) = external.clear().await {
                warn!(error = %err, "external tier clear failed");
                self.metrics.record_error("store");
                self.metrics.set_external_connected(false);
            }
        }
        info!("cache cleared");
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub fn len(&self) -> usize {
        rw_read(&self.local, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-entry view of the local tier.
    pub fn inspect_local(&self) -> Vec<EntrySummary> {
        rw_read(&self.local, SOURCE, "inspect_local")
            .iter()
            .map(|(key, entry)| EntrySummary {
                key: key.clone(),
                age_seconds: entry.age().as_secs(),
                remaining_ttl_seconds: entry.remaining_ttl().as_secs(),
                ttl_seconds: entry.ttl_seconds,
                hit_count: entry.hit_count,
                stale: entry.is_stale(),
                expired: entry.is_expired(),
            })
            .collect()
    }

    /// Both-tier inspection report. External listing is best-effort.
    pub async fn inspect(&self) -> InspectReport {
        let external_keys = match &self.external {
            Some(external) => external.list_keys("*").await.unwrap_or_default(),
            None => Vec::new(),
        };
        InspectReport {
            local: self.inspect_local(),
            external_keys,
        }
    }

    /// Probe external tier connectivity and update the gauge.
    pub async fn probe_external(&self) -> bool {
        let Some(external) = &self.external else {
            return false;
        };
        let connected = external.ping().await.is_ok();
        self.metrics.set_external_connected(connected);
        connected
    }

    pub fn external_enabled(&self) -> bool {
        self.external.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

/// Summary of one resident local-tier entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub key: String,
    pub age_seconds: u64,
    pub remaining_ttl_seconds: u64,
    pub ttl_seconds: u64,
    pub hit_count: u64,
    pub stale: bool,
    pub expired: bool,
}

/// Inspection report across both tiers.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub local: Vec<EntrySummary>,
    pub external_keys: Vec<String>,
}
