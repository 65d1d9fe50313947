//! Bounded, time-expiring result cache.
//!
//! Entries are keyed by a [`CacheKey`], a SHA-256 fingerprint of an input
//! paired with a [`CacheScope`]. The scope is part of the key's identity, so
//! a per-stage entry can never collide with a whole-pipeline entry for the
//! same input.
//!
//! Eviction is by insertion order, not recency of use: when the store is
//! full, the entry inserted first is dropped even if it was read a moment
//! ago. Overwriting an existing key keeps its original position. Expired
//! entries are removed lazily when a read touches them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::PatentflowError;
use crate::state::StageName;

/// What a cache entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// The final state of a whole run.
    Workflow,
    /// The state produced by a single stage.
    Stage(StageName),
}

impl CacheScope {
    /// Returns the scope label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Stage(stage) => stage.as_str(),
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deterministic fingerprint of `(scope, input)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    scope: CacheScope,
    digest: String,
}

impl CacheKey {
    /// Fingerprints `input` within `scope`.
    #[must_use]
    pub fn new(scope: CacheScope, input: &str) -> Self {
        Self {
            scope,
            digest: fingerprint(input),
        }
    }

    /// Key for a whole-pipeline result.
    #[must_use]
    pub fn workflow(input: &str) -> Self {
        Self::new(CacheScope::Workflow, input)
    }

    /// Key for a single stage result.
    #[must_use]
    pub fn stage(stage: StageName, input: &str) -> Self {
        Self::new(CacheScope::Stage(stage), input)
    }

    /// Returns the scope.
    #[must_use]
    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.digest)
    }
}

/// Hex-encoded SHA-256 of `input`.
#[must_use]
pub fn fingerprint(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the orchestrator consults the cache at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Entry lifetime in seconds.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Maximum number of entries.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_max_entries() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = ttl.as_secs();
        self
    }

    /// Sets the capacity.
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Turns caching off.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the TTL as a duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), PatentflowError> {
        if self.max_entries == 0 {
            return Err(PatentflowError::InvalidConfig(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters describing cache behavior since the last clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads that found a live entry.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
    /// Current number of entries.
    pub size: usize,
}

#[derive(Debug)]
struct CacheEntry<V> {
    data: V,
    timestamp: Instant,
    seq: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    /// Insertion sequence -> key, oldest first.
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
    stats: CacheStats,
}

impl<V> Default for CacheInner<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            stats: CacheStats::default(),
        }
    }
}

impl<V> CacheInner<V> {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

/// Thread-safe TTL cache with insertion-order eviction.
///
/// Values are cloned out on read; callers never hold a reference into the
/// store.
#[derive(Debug)]
pub struct CacheStore<V> {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> CacheStore<V> {
    /// Creates a store with the given TTL and capacity.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Creates a store from configuration.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    /// Returns the TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a copy of the live value for `key`.
    ///
    /// An expired entry is removed as a side effect.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.timestamp.elapsed() > self.ttl,
        };

        if expired {
            inner.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            tracing::debug!(key = %key, "Cache entry expired");
            return None;
        }

        inner.stats.hits += 1;
        inner.entries.get(key).map(|entry| entry.data.clone())
    }

    /// Stores `value` under `key`, evicting the oldest entry when full.
    pub fn set(&self, key: CacheKey, value: V) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.data = value;
            entry.timestamp = now;
            return;
        }

        if inner.entries.len() >= self.capacity {
            if let Some((_, oldest)) = inner.order.pop_first() {
                inner.entries.remove(&oldest);
                inner.stats.evictions += 1;
                tracing::debug!(key = %oldest, "Cache entry evicted");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                data: value,
                timestamp: now,
                seq,
            },
        );
    }

    /// Removes `key`, returning its value if present.
    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.inner.lock().remove(key).map(|entry| entry.data)
    }

    /// Drops every entry and resets the counters.
    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::default();
    }

    /// Returns the number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Returns true if `key` is stored, without touching expiry or counters.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Returns the current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            ..inner.stats
        }
    }
}

impl<V: Clone> Default for CacheStore<V> {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
