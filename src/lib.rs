//! Dispensa Content API Cache
//!
//! Serves API responses from a two-tier cache and keeps entries fresh
//! with stale-while-revalidate:
//!
//! - **Local tier**: in-process LRU map, no I/O on the hot path
//! - **External tier**: optional shared Redis store, promoted into the
//!   local tier on hit
//!
//! Entries past half their TTL are served immediately while a bounded
//! background worker refreshes them. Content-change webhooks invalidate
//! exact keys or `*` wildcard patterns across both tiers.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `dispensa.toml` (overridable with
//! `DISPENSA__*` environment variables):
//!
//! ```toml
//! [ttl]
//! posts = 300
//! post = 3600
//!
//! [memory]
//! max_entries = 1000
//!
//! [external]
//! enabled = true
//! url = "redis://127.0.0.1:6379"
//! # ... see config.rs for all options
//! ```

pub mod config;
mod entry;
pub mod error;
pub mod external;
mod keys;
mod lock;
mod metrics;
mod middleware;
mod ops;
mod revalidate;
mod router;
mod store;
mod swr;
mod webhook;

pub use config::{
    CacheConfig, ExternalSettings, MemorySettings, MetricsSettings, RevalidationSettings,
    WebhookSettings,
};
pub use entry::{CacheEntry, STALE_AGE_FRACTION};
pub use error::{BoxError, CacheError, ConfigError, StoreError};
pub use external::{ExternalTier, RedisTier};
pub use keys::{RequestKey, content_type_of, etag_for, pattern_matches};
pub use metrics::{CacheHealth, HealthStatus, MetricsCollector, MetricsSnapshot};
pub use middleware::{RequestCacheState, RoutePolicy, request_cache_layer};
pub use ops::ops_routes;
pub use revalidate::{Fetch, Priority, RevalidationQueue, RevalidationScheduler, fetch_fn};
pub use router::{InvalidationOutcome, InvalidationRouter, InvalidationRule};
pub use store::{CacheEntryStore, EntrySummary, InspectReport};
pub use swr::ContentCache;
pub use webhook::{SIGNATURE_HEADER, WebhookPayload, signature_for, verify_signature, webhook_routes};
