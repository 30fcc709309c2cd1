//! Error taxonomy for the cache layer.
//!
//! Tier faults (`StoreError`) never reach request callers; only a cold
//! miss whose fetch fails with no resident fallback surfaces, and it
//! surfaces as the fetcher's own error wrapped in `CacheError::Fetch`.

use thiserror::Error;

/// Boxed error type produced by caller-supplied fetchers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// External tier failures. Non-fatal: logged and counted, the operation
/// falls back to local-tier-only behavior.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("external tier connection unavailable: {0}")]
    Pool(String),
    #[error("external tier command failed: {0}")]
    Command(#[from] redis::RedisError),
    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level cache error surfaced to callers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Caller-supplied fetcher failed on a cold miss with no recoverable
    /// stale data.
    #[error("fetch failed for key `{key}`: {source}")]
    Fetch {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration failures. Fatal at construction only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("ttl for content type `{content_type}` must be greater than zero")]
    ZeroTtl { content_type: String },
    #[error("default ttl must be greater than zero")]
    ZeroDefaultTtl,
    #[error("webhook secret must be set when webhook verification is enabled")]
    MissingWebhookSecret,
    #[error("external tier is enabled but no url is configured")]
    MissingExternalUrl,
}
