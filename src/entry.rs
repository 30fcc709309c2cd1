//! Cache entry type and freshness bookkeeping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;

/// Fraction of the TTL after which an entry is considered stale and a
/// background refresh is queued. Fixed policy, not configurable per key.
pub const STALE_AGE_FRACTION: f64 = 0.5;

/// A single cached API response.
///
/// Entries are replaced atomically as whole objects; `hit_count` is the
/// only field mutated in place. Serialized as JSON for the external tier
/// (`created_at` as unix seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    pub ttl_seconds: u64,
    pub hit_count: u64,
    /// Monotonic write generation, used to fence stale revalidation
    /// results against concurrent invalidation.
    pub generation: u64,
}

impl CacheEntry {
    /// Create a fresh entry. A zero TTL is clamped to one second to keep
    /// the `ttl_seconds > 0` invariant.
    pub fn new(key: impl Into<String>, data: Value, ttl: Duration, generation: u64) -> Self {
        Self {
            key: key.into(),
            data,
            created_at: OffsetDateTime::now_utc(),
            ttl_seconds: ttl.as_secs().max(1),
            hit_count: 0,
            generation,
        }
    }

    /// Rewrite the creation timestamp. Used when promoting external-tier
    /// entries and by tests that need aged entries.
    pub fn with_created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = created_at;
        self
    }

    /// Age of the entry. Saturates to zero for clock skew.
    pub fn age(&self) -> Duration {
        let elapsed = OffsetDateTime::now_utc() - self.created_at;
        elapsed.try_into().unwrap_or(Duration::ZERO)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// TTL not yet elapsed; zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl().saturating_sub(self.age())
    }

    pub fn is_expired(&self) -> bool {
        self.age() >= self.ttl()
    }

    /// True once the entry is past `STALE_AGE_FRACTION` of its TTL.
    pub fn is_stale(&self) -> bool {
        let threshold_ms = (self.ttl().as_millis() as f64 * STALE_AGE_FRACTION) as u128;
        self.age().as_millis() > threshold_ms
    }
}
