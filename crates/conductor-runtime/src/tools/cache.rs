//! Tool-result caching.
//!
//! Optional in-memory cache of successful tool payloads, keyed by tool id and
//! canonicalized arguments. Disabled by default: most telemetry answers are
//! time-sensitive, so opting in is a per-deployment decision. Failures are
//! never cached; a cached hit bypasses the circuit breaker and records no
//! outcome on it.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conductor_core::budget::duration_secs;

use super::ToolId;

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCacheConfig {
    /// Whether the cache is active at all.
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of cached payloads.
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,

    /// Time-to-live per entry (in seconds).
    #[serde(default = "default_ttl", with = "duration_secs")]
    pub ttl: Duration,
}

fn default_max_entries() -> u64 {
    1024
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

impl Default for ToolCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: default_max_entries(),
            ttl: default_ttl(),
        }
    }
}

/// Cache key: tool id plus a hash of its canonicalized arguments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    tool: ToolId,
    arguments_hash: u64,
}

impl CacheKey {
    pub fn new(tool: ToolId, arguments: &Value) -> Self {
        Self {
            tool,
            arguments_hash: hash_arguments(arguments),
        }
    }
}

/// Successful tool payloads, cached with moka.
pub struct ToolResultCache {
    cache: Cache<CacheKey, Value>,
}

impl ToolResultCache {
    /// Create a cache with the given bounds.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// Build from configuration; `None` when caching is disabled.
    pub fn from_config(config: &ToolCacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.max_entries, config.ttl))
    }

    /// Get a cached payload.
    pub async fn get(&self, tool: ToolId, arguments: &Value) -> Option<Value> {
        self.cache.get(&CacheKey::new(tool, arguments)).await
    }

    /// Store a successful payload.
    pub async fn insert(&self, tool: ToolId, arguments: &Value, payload: Value) {
        self.cache.insert(CacheKey::new(tool, arguments), payload).await;
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

// serde_json maps are BTreeMap-backed, so the serialized form is key-sorted
// and hashing it gives the same key regardless of argument order on the wire.
fn hash_arguments(arguments: &Value) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    arguments.to_string().hash(&mut hasher);
    hasher.finish()
}
