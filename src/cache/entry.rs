//! Cache Entry Types
//!
//! Keys, entries and the value bound shared by every tier.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::clock;

/// Bound for values stored in the cache
///
/// Values must be cloneable for the memory tier and serde-serializable
/// for the disk tier.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Cache key
///
/// Opaque string identifier with a precomputed hash for fast comparison.
#[derive(Clone)]
pub struct CacheKey {
    /// Precomputed FxHash of the key
    hash: u64,
    /// Full key
    key: Arc<str>,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(key: impl Into<String>) -> Self {
        let key: String = key.into();
        Self {
            hash: Self::fx_hash(key.as_bytes()),
            key: Arc::from(key),
        }
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Get the key string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Get the precomputed hash
    #[inline]
    pub fn fast_hash(&self) -> u64 {
        self.hash
    }

    /// Filesystem-safe SHA-256 digest of the key (lowercase hex)
    ///
    /// One-way: the key is never recovered from the digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        self.hash == other.hash && self.key == other.key
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&&*self.key).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(CacheKey::new)
    }
}

/// Cache entry containing a value and its bookkeeping
#[derive(Clone)]
pub struct CacheEntry<V> {
    value: V,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    access_count: u64,
    ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    /// Create a new entry created at `now`
    pub fn new(value: V, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl,
        }
    }

    /// Get the value
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Take the value out of the entry
    pub fn into_value(self) -> V {
        self.value
    }

    /// Creation timestamp
    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last successful read
    #[inline]
    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    /// Number of successful reads
    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Entry-specific time to live
    #[inline]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Record a read and return the new access count
    #[inline]
    pub fn touch(&mut self, now: DateTime<Utc>) -> u64 {
        self.last_accessed = now;
        self.access_count += 1;
        self.access_count
    }

    /// Instant after which the entry is expired
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl.map(|ttl| clock::add(self.created_at, ttl))
    }

    /// Check if the entry has expired
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => clock::elapsed(now, self.created_at) > ttl,
            None => false,
        }
    }

    /// Time left before expiry (`None` when the entry never expires)
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_sub(clock::elapsed(now, self.created_at)))
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("created_at", &self.created_at)
            .field("access_count", &self.access_count)
            .field("ttl", &self.ttl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
