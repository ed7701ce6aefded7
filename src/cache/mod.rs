//! Multi-Tier Cache
//!
//! Memory (L1), disk (L2) and HTTP validation (L3) tiers composed behind a
//! single coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          CacheCoordinator                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 MemoryTier         │ L2 DiskTier           │ L3 NetworkValidation    │
//! │  ┌──────────────────┐  │ ┌──────────────────┐  │ ┌────────────────────┐  │
//! │  │ HashMap + policy │  │ │ metadata.json    │  │ │ ETag / max-age     │  │
//! │  │ LRU/LFU/FIFO/TTL │  │ │ + <sha256>.bin   │  │ │ conditional GET    │  │
//! │  │ entry-bounded    │  │ │ byte-bounded     │  │ │ no storage         │  │
//! │  └──────────────────┘  │ └──────────────────┘  │ └────────────────────┘  │
//! │          ▲             │          ▲            │            │            │
//! │          └─────────────┴──────────┴────────────┴────────────┘            │
//! │                   backfill: L2 first, then L1                            │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Each tier owns its entries; no lock spans two tiers
//! - A miss is `None`, never an error
//! - Corruption of one disk entry evicts that key only
//! - Time comes from an injected [`Clock`]

mod clock;
mod entry;
mod l1;
mod l2;
mod l3;
mod manager;
mod metrics;
mod policy;
#[cfg(test)]
mod proptest;
pub mod compression;

use std::time::Duration;

use async_trait::async_trait;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use compression::{Codec, CompressionAlgorithm, CompressionConfig};
pub use entry::{CacheEntry, CacheKey, CacheValue};
pub use l1::{MemoryConfig, MemoryStats, MemoryTier};
pub use l2::{
    DiskConfig, DiskHit, DiskStats, DiskTier, IndexEntry, MetadataIndex, INDEX_FILE,
    INDEX_VERSION,
};
pub use l3::{
    BytesDecoder, CacheControl, FetchOutcome, FreshnessDecision, HttpRequest, HttpResponse,
    HttpTransport, JsonDecoder, NetworkConfig, NetworkStats, NetworkValidationTier,
    ReqwestTransport, ResponseDecoder, StaticTransport, ValidationMetadata,
};
pub use manager::{CacheCoordinator, CacheCoordinatorBuilder, CacheResult, CacheTier};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use policy::{EvictionPolicy, FifoPolicy, LfuPolicy, LruPolicy, PolicyKind, TtlPolicy};

use crate::error::Result;

/// Default L1 capacity (entries)
pub const DEFAULT_L1_CAPACITY: usize = 10_000;

/// Default L2 capacity (1GB)
pub const DEFAULT_L2_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Default fraction of L2 capacity eviction drains down to
pub const DEFAULT_L2_TARGET_RATIO: f64 = 0.8;

/// Default interval of the expiry sweeper
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Tier
// =============================================================================

/// Storage tier behind one async interface
///
/// The memory tier completes without suspending.
#[async_trait]
pub trait Tier<V: CacheValue>: Send + Sync {
    /// Which tier this is
    fn kind(&self) -> CacheTier;

    /// Get a live value
    async fn get(&self, key: &CacheKey) -> Result<Option<V>>;

    /// Store a value; `None` applies the tier's default TTL
    async fn put(&self, key: CacheKey, value: V, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key, returning whether it was present
    async fn remove(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every entry
    async fn clear(&self) -> Result<()>;

    /// Check for a live entry
    async fn contains(&self, key: &CacheKey) -> Result<bool>;

    /// Number of live entries
    async fn len(&self) -> Result<usize>;
}

#[async_trait]
impl<V: CacheValue> Tier<V> for MemoryTier<V> {
    fn kind(&self) -> CacheTier {
        CacheTier::L1
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<V>> {
        Ok(MemoryTier::get(self, key))
    }

    async fn put(&self, key: CacheKey, value: V, ttl: Option<Duration>) -> Result<()> {
        MemoryTier::put(self, key, value, ttl)
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(MemoryTier::remove(self, key))
    }

    async fn clear(&self) -> Result<()> {
        MemoryTier::clear(self);
        Ok(())
    }

    async fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(MemoryTier::contains(self, key))
    }

    async fn len(&self) -> Result<usize> {
        Ok(MemoryTier::len(self))
    }
}

#[async_trait]
impl<V: CacheValue> Tier<V> for DiskTier<V> {
    fn kind(&self) -> CacheTier {
        CacheTier::L2
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<V>> {
        DiskTier::get(self, key).await
    }

    async fn put(&self, key: CacheKey, value: V, ttl: Option<Duration>) -> Result<()> {
        DiskTier::put(self, key, &value, ttl).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        DiskTier::remove(self, key).await
    }

    async fn clear(&self) -> Result<()> {
        DiskTier::clear(self).await
    }

    async fn contains(&self, key: &CacheKey) -> Result<bool> {
        DiskTier::contains(self, key).await
    }

    async fn len(&self) -> Result<usize> {
        DiskTier::len(self).await
    }
}

// =============================================================================
// Tests
// =============================================================================
