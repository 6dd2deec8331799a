//! In-memory fetch cache with TTL expiry and LRU eviction.
//!
//! Successful fetch results are cached under a source-scoped key so that
//! repeated runs over overlapping item sets skip the external call. Entries
//! expire after their TTL and are evicted least-recently-used first once
//! the cache reaches capacity. Failures are never cached.

use crate::errors::ConfigError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Sizing and expiry settings for the fetch cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default time-to-live for entries, in seconds. `None` disables expiry.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: Option<u64>,
    /// Maximum number of entries held before LRU eviction kicks in.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_ttl_seconds() -> Option<u64> {
    Some(3600)
}

fn default_max_entries() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = Some(ttl.as_secs());
        self
    }

    /// Disables expiry entirely.
    #[must_use]
    pub fn without_ttl(mut self) -> Self {
        self.ttl_seconds = None;
        self
    }

    /// Sets the entry capacity.
    #[must_use]
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::new("max_entries", "must be >= 1"));
        }
        if self.ttl_seconds == Some(0) {
            return Err(ConfigError::new("ttl_seconds", "must be > 0 when set"));
        }
        Ok(())
    }

    fn default_ttl(&self) -> Option<Duration> {
        self.ttl_seconds.map(Duration::from_secs)
    }
}

/// Counters describing cache effectiveness over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that returned a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or only an expired entry).
    pub misses: u64,
    /// Values stored, including overwrites.
    pub insertions: u64,
    /// Entries removed to make room at capacity.
    pub evictions: u64,
    /// Entries removed because their TTL lapsed.
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
    ticks: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.stats.expirations += (before - self.entries.len()) as u64;
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }
}

/// Shared in-memory cache for successful fetch results.
///
/// Cheap to clone; all clones observe the same entries and statistics.
#[derive(Debug, Clone)]
pub struct FetchCache {
    inner: Arc<Mutex<CacheInner>>,
    config: CacheConfig,
}

impl FetchCache {
    /// Creates a cache with the given configuration.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            config,
        }
    }

    /// Builds the source-scoped key under which a value is stored.
    #[must_use]
    pub fn scoped_key(source: &str, key: &str) -> String {
        format!("{source}:{key}")
    }

    /// Looks up a value, treating expired entries as absent.
    ///
    /// An expired entry observed here is removed. Live hits refresh the
    /// entry's recency.
    #[must_use]
    pub fn get(&self, source: &str, key: &str) -> Option<serde_json::Value> {
        let scoped = Self::scoped_key(source, key);
        let now = Utc::now();
        let mut inner = self.inner.lock();

        match inner.entries.get(&scoped) {
            Some(entry) if entry.is_expired(now) => {
                inner.entries.remove(&scoped);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                None
            }
            Some(entry) => {
                let value = entry.value.clone();
                let tick = inner.next_tick();
                if let Some(entry) = inner.entries.get_mut(&scoped) {
                    entry.last_used = tick;
                }
                inner.stats.hits += 1;
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Stores a value under the configured default TTL.
    pub fn put(&self, source: &str, key: &str, value: serde_json::Value) {
        self.insert(source, key, value, self.config.default_ttl());
    }

    /// Stores a value with an explicit TTL, overriding the default.
    pub fn put_with_ttl(&self, source: &str, key: &str, value: serde_json::Value, ttl: Duration) {
        self.insert(source, key, value, Some(ttl));
    }

    fn insert(&self, source: &str, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let scoped = Self::scoped_key(source, key);
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| now + chrono_duration(ttl));
        let mut inner = self.inner.lock();

        // Make room before inserting a new key. Expired entries go first so
        // a stale entry never costs a live one its slot.
        if !inner.entries.contains_key(&scoped) && inner.entries.len() >= self.config.max_entries {
            inner.sweep_expired(now);
            while inner.entries.len() >= self.config.max_entries {
                inner.evict_lru();
            }
        }

        let tick = inner.next_tick();
        inner.entries.insert(
            scoped,
            CacheEntry {
                value,
                expires_at,
                last_used: tick,
            },
        );
        inner.stats.insertions += 1;
    }

    /// Removes a single entry if present.
    pub fn invalidate(&self, source: &str, key: &str) {
        let scoped = Self::scoped_key(source, key);
        self.inner.lock().entries.remove(&scoped);
    }

    /// Removes every entry, keeping lifetime statistics.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Returns the number of stored entries, expired ones included until
    /// they are observed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true when the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Returns a snapshot of the lifetime statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl Default for FetchCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

fn chrono_duration(ttl: Duration) -> chrono::Duration {
    let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(millis)
}
