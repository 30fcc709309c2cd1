//! Cache configuration: typed settings with layered precedence (file → env).
//!
//! Loaded from `dispensa.toml` when present, overridable via
//! `DISPENSA__*` environment variables (`DISPENSA__MEMORY__MAX_ENTRIES`,
//! `DISPENSA__EXTERNAL__URL`, ...). Immutable after construction;
//! validation failures are fatal at startup.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

const LOCAL_CONFIG_BASENAME: &str = "dispensa";
const ENV_PREFIX: &str = "DISPENSA";

const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_KEY_PREFIX: &str = "content_cache:";
const DEFAULT_BUSY_INTERVAL_MS: u64 = 2000;
const DEFAULT_IDLE_INTERVAL_MS: u64 = 5000;
const DEFAULT_JOBS_PER_TICK: usize = 3;
const DEFAULT_MAX_JOB_AGE_SECS: u64 = 5 * 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Top-level cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-content-type TTLs in seconds, keyed by the key prefix before
    /// the first `:`.
    pub ttl: BTreeMap<String, u64>,
    /// Fallback TTL for content types absent from the table.
    pub default_ttl_seconds: u64,
    /// Content types whose cache keys include an auth-token hash.
    pub user_scoped: Vec<String>,
    pub memory: MemorySettings,
    pub external: ExternalSettings,
    pub webhook: WebhookSettings,
    pub metrics: MetricsSettings,
    pub revalidation: RevalidationSettings,
}

/// Local-tier capacity bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Maximum entries resident in the local tier.
    pub max_entries: usize,
}

/// Shared external tier (Redis) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalSettings {
    pub enabled: bool,
    pub url: Option<String>,
    /// Namespace prepended to every external-tier key.
    pub key_prefix: String,
}

/// Webhook signature verification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub enabled: bool,
    /// Shared secret for `sha256(payload || secret)` signatures.
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Toggles response-time bookkeeping; counters are always maintained.
    pub enabled: bool,
}

/// Background revalidation worker cadence and bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RevalidationSettings {
    /// Tick interval while jobs are pending.
    pub busy_interval_ms: u64,
    /// Tick interval while the queue is empty.
    pub idle_interval_ms: u64,
    /// Maximum jobs processed per tick.
    pub jobs_per_tick: usize,
    /// Jobs older than this are dropped regardless of remaining attempts.
    pub max_job_age_secs: u64,
    /// Fetch attempts before a failing job is abandoned.
    pub max_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut ttl = BTreeMap::new();
        ttl.insert("posts".to_string(), 300);
        ttl.insert("post".to_string(), 3600);
        ttl.insert("categories".to_string(), 86400);
        ttl.insert("sitemap".to_string(), 21600);
        Self {
            ttl,
            default_ttl_seconds: DEFAULT_TTL_SECS,
            user_scoped: vec!["post".to_string()],
            memory: MemorySettings::default(),
            external: ExternalSettings::default(),
            webhook: WebhookSettings::default(),
            metrics: MetricsSettings::default(),
            revalidation: RevalidationSettings::default(),
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: String::new(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for RevalidationSettings {
    fn default() -> Self {
        Self {
            busy_interval_ms: DEFAULT_BUSY_INTERVAL_MS,
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
            jobs_per_tick: DEFAULT_JOBS_PER_TICK,
            max_job_age_secs: DEFAULT_MAX_JOB_AGE_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl CacheConfig {
    /// Load configuration from the default file and environment layers.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, optionally from an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false)),
        };
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that must hold for the process lifetime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (content_type, seconds) in &self.ttl {
            if *seconds == 0 {
                return Err(ConfigError::ZeroTtl {
                    content_type: content_type.clone(),
                });
            }
        }
        if self.default_ttl_seconds == 0 {
            return Err(ConfigError::ZeroDefaultTtl);
        }
        if self.webhook.enabled && self.webhook.secret.is_empty() {
            return Err(ConfigError::MissingWebhookSecret);
        }
        if self.external.enabled && self.external.url.is_none() {
            return Err(ConfigError::MissingExternalUrl);
        }
        Ok(())
    }

    /// Effective TTL for a content type, falling back to the default.
    pub fn ttl_for(&self, content_type: &str) -> Duration {
        let seconds = self
            .ttl
            .get(content_type)
            .copied()
            .unwrap_or(self.default_ttl_seconds);
        Duration::from_secs(seconds)
    }

    /// Returns the local-tier capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

impl RevalidationSettings {
    pub fn busy_interval(&self) -> Duration {
        Duration::from_millis(self.busy_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn max_job_age(&self) -> Duration {
        Duration::from_secs(self.max_job_age_secs)
    }
}
