//! Cache metrics: fire-and-forget counters and derived gauges.
//!
//! Counters are plain atomics so no component ever blocks on a metrics
//! update. Derived values (hit rate, error rate, average response time)
//! are computed on snapshot, never stored. Counts are mirrored into the
//! `metrics` facade for whichever exporter the host application installs.

use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge,
    histogram};
use serde::Serialize;
use time::OffsetDateTime;

const METRIC_HIT_TOTAL: &str = "dispensa_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "dispensa_cache_miss_total";
const METRIC_SET_TOTAL: &str = "dispensa_cache_set_total";
const METRIC_INVALIDATION_TOTAL: &str = "dispensa_cache_invalidation_total";
const METRIC_ERROR_TOTAL: &str = "dispensa_cache_error_total";
const METRIC_EVICT_TOTAL: &str = "dispensa_cache_evict_total";
const METRIC_OP_MS: &str = "dispensa_cache_op_ms";
const METRIC_EXTERNAL_UP: &str = "dispensa_cache_external_up";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register metric descriptions with the installed recorder, once.
pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_HIT_TOTAL, Unit::Count, "Total cache hits by tier.");
        describe_counter!(METRIC_MISS_TOTAL, Unit::Count, "Total cache misses.");
        describe_counter!(METRIC_SET_TOTAL, Unit::Count, "Total cache writes.");
        describe_counter!(
            METRIC_INVALIDATION_TOTAL,
            Unit::Count,
            "Total entries removed by invalidation."
        );
        describe_counter!(
            METRIC_ERROR_TOTAL,
            Unit::Count,
            "Total non-fatal cache errors by source."
        );
        describe_counter!(
            METRIC_EVICT_TOTAL,
            Unit::Count,
            "Total local-tier evictions under capacity pressure."
        );
        describe_histogram!(
            METRIC_OP_MS,
            Unit::Milliseconds,
            "Cache operation latency."
        );
        describe_gauge!(
            METRIC_EXTERNAL_UP,
            Unit::Count,
            "External tier connectivity (1 connected, 0 not)."
        );
    });
}

/// In-process cache counters shared by every cache component.
pub struct MetricsCollector {
    timing_enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
    response_time_total_us: AtomicU64,
    response_time_samples: AtomicU64,
    external_connected: AtomicBool,
}

impl MetricsCollector {
    pub fn new(timing_enabled: bool) -> Self {
        Self {
            timing_enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            response_time_total_us: AtomicU64::new(0),
            response_time_samples: AtomicU64::new(0),
            external_connected: AtomicBool::new(false),
        }
    }

    pub fn record_hit(&self, tier: &'static str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT_TOTAL, "tier" => tier).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS_TOTAL).increment(1);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_SET_TOTAL).increment(1);
    }

    pub fn record_invalidations(&self, count: u64) {
        if count > 0 {
            self.invalidations.fetch_add(count, Ordering::Relaxed);
            counter!(METRIC_INVALIDATION_TOTAL).increment(count);
        }
    }

    pub fn record_error(&self, source: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_ERROR_TOTAL, "source" => source).increment(1);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_EVICT_TOTAL).increment(1);
    }

    /// Record an operation's wall time. Skipped when timing is disabled.
    pub fn record_timing(&self, op: &'static str, elapsed: Duration) {
        if !self.timing_enabled {
            return;
        }
        self.response_time_total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.response_time_samples.fetch_add(1, Ordering::Relaxed);
        histogram!(METRIC_OP_MS, "op" => op).record(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn set_external_connected(&self, connected: bool) {
        self.external_connected.store(connected, Ordering::Relaxed);
        gauge!(METRIC_EXTERNAL_UP).set(if connected { 1.0 } else { 0.0 });
    }

    pub fn external_connected(&self) -> bool {
        self.external_connected.load(Ordering::Relaxed)
    }

    /// Point-in-time view with derived rates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let sets = self.sets.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let operations = lookups + sets;
        let samples = self.response_time_samples.load(Ordering::Relaxed);

        MetricsSnapshot {
            hits,
            misses,
            sets,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            errors,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            error_rate: if operations > 0 {
                errors as f64 / operations as f64
            } else {
                0.0
            },
            average_response_time_ms: if samples > 0 {
                self.response_time_total_us.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
            } else {
                0.0
            },
            external_connected: self.external_connected(),
            last_updated: OffsetDateTime::now_utc(),
        }
    }

    /// Zero every counter. Operator action only, never implicit.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.response_time_total_us.store(0, Ordering::Relaxed);
        self.response_time_samples.store(0, Ordering::Relaxed);
    }
}

/// Serializable counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub errors: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub external_connected: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

// ============================================================================
// Health classification
// ============================================================================

const HEALTHY_HIT_RATE_FLOOR: f64 = 0.70;
const HEALTHY_ERROR_RATE_CEILING: f64 = 0.05;
/// Ignore hit-rate noise until the cache has seen some traffic.
const HIT_RATE_MIN_LOOKUPS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Operator-facing health report derived from a metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub metrics: MetricsSnapshot,
}

impl CacheHealth {
    pub(crate) fn from_snapshot(snapshot: MetricsSnapshot, external_expected: bool) -> Self {
        let mut issues = Vec::new();

        if snapshot.hits + snapshot.misses >= HIT_RATE_MIN_LOOKUPS
            && snapshot.hit_rate < HEALTHY_HIT_RATE_FLOOR
        {
            issues.push(format!(
                "low cache hit rate: {:.1}%",
                snapshot.hit_rate * 100.0
            ));
        }
        if snapshot.error_rate > HEALTHY_ERROR_RATE_CEILING {
            issues.push(format!(
                "high error rate: {:.1}%",
                snapshot.error_rate * 100.0
            ));
        }
        if external_expected && !snapshot.external_connected {
            issues.push("external tier unavailable".to_string());
        }

        let status = match issues.len() {
            0 => HealthStatus::Healthy,
            1 | 2 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        };

        Self {
            status,
            issues,
            metrics: snapshot,
        }
    }
}
