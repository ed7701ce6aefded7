//! L1 Cache - In-Process Memory Tier
//!
//! Bounded key→value store guarded by a single exclusive lock.
//!
//! # Design
//!
//! - Capacity is an entry count; the bound holds after every `put`
//! - One eviction per insertion, never bulk eviction
//! - Values are stored behind `Arc` so the clone returned by `get`
//!   happens after the lock is released
//! - Expired entries are purged lazily on access or by `purge_expired`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clock::{system_clock, SharedClock};
use super::entry::{CacheEntry, CacheKey};
use super::policy::{EvictionPolicy, PolicyKind};
use super::DEFAULT_L1_CAPACITY;
use crate::error::{Error, Result};

/// L1 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Eviction policy
    pub policy: PolicyKind,
    /// TTL applied when `put` is called without one (seconds)
    pub default_ttl_secs: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_L1_CAPACITY,
            policy: PolicyKind::Lru,
            default_ttl_secs: None,
        }
    }
}

impl MemoryConfig {
    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }
}

struct Inner<V> {
    entries: HashMap<CacheKey, CacheEntry<Arc<V>>>,
    policy: Box<dyn EvictionPolicy>,
}

/// L1 Cache - in-process memory tier
pub struct MemoryTier<V> {
    /// Entries and eviction bookkeeping
    inner: Mutex<Inner<V>>,
    /// Maximum number of entries
    capacity: usize,
    /// TTL applied when none is given
    default_ttl: Option<Duration>,
    /// Time source
    clock: SharedClock,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
    /// Expired entries purged
    expirations: AtomicU64,
}

impl<V: Clone> MemoryTier<V> {
    /// Create a memory tier from configuration
    pub fn new(config: &MemoryConfig, clock: SharedClock) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::Capacity(
                "memory tier capacity must be at least one entry".into(),
            ));
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(config.capacity.min(4096)),
                policy: config.policy.build(),
            }),
            capacity: config.capacity,
            default_ttl: config.default_ttl(),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    /// Create an LRU memory tier on the system clock
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::new(
            &MemoryConfig {
                capacity,
                ..Default::default()
            },
            system_clock(),
        )
    }

    /// Get a value, `None` when absent or expired
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = self.clock.now();

        let handle = {
            let mut inner = self.inner.lock();
            let Inner { entries, policy } = &mut *inner;

            match entries.get_mut(key) {
                Some(entry) if entry.is_expired(now) => {
                    entries.remove(key);
                    policy.remove(key);
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(entry) => {
                    policy.record_access(key);
                    entry.touch(now);
                    Some(Arc::clone(entry.value()))
                }
                None => None,
            }
        };

        match handle {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some((*value).clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a value
    ///
    /// Replacing an existing key never evicts. Otherwise a full tier gives up
    /// exactly one entry chosen by the policy.
    pub fn put(&self, key: CacheKey, value: V, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        let entry = CacheEntry::new(Arc::new(value), ttl.or(self.default_ttl), now);
        let expires_at = entry.expires_at();

        let (replaced, evicted) = {
            let mut inner = self.inner.lock();
            let Inner { entries, policy } = &mut *inner;

            let mut evicted = None;
            if !entries.contains_key(&key) {
                while entries.len() >= self.capacity {
                    match policy.evict_one() {
                        Some(victim) => {
                            if let Some(old) = entries.remove(&victim) {
                                evicted = Some((victim, old));
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }

            policy.record_insert(&key, expires_at);
            (entries.insert(key, entry), evicted)
        };

        if let Some((victim, _)) = &evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, "L1 evicted entry");
        }
        drop(replaced);
        Ok(())
    }

    /// Remove a key, returning whether it was present
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            inner.policy.remove(key);
            inner.entries.remove(key)
        };
        removed.is_some()
    }

    /// Check if a live entry exists without touching it
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Remaining TTL of a live entry (`Some(None)` when it never expires)
    pub fn remaining_ttl(&self, key: &CacheKey) -> Option<Option<Duration>> {
        let now = self.clock.now();
        self.inner
            .lock()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.remaining_ttl(now))
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live keys
    pub fn keys(&self) -> Vec<CacheKey> {
        let now = self.clock.now();
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let Inner { entries, policy } = &mut *inner;

        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
            policy.remove(key);
        }

        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Clear the cache
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.policy.clear();
    }

    /// Release all entries
    pub fn dispose(&self) {
        self.clear();
    }

    /// Name of the active eviction policy
    pub fn policy_name(&self) -> &'static str {
        self.inner.lock().policy.name()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl<V> std::fmt::Debug for MemoryTier<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

/// L1 cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Number of entries
    pub entries: usize,
    /// Capacity in entries
    pub capacity: usize,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Eviction count
    pub evictions: u64,
    /// Expired entries purged
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================
