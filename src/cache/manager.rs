//! Cache Coordinator - Unified Multi-Tier Cache
//!
//! Composes L1 (memory), L2 (disk) and L3 (network validation) into one
//! logical cache with cascading lookup, write-through and backfill.
//!
//! # Read path
//!
//! ```text
//! get(k) ─► L1 ─hit─► value
//!            │miss
//!            ▼
//!           L2 ─hit, fresh/unknown─► backfill L1 ─► value
//!            │miss or stale
//!            ▼
//!           L3 ─200─► backfill L2, then L1 ─► value
//!               ─304─► refresh L2 validators ─► stored value
//!               ─404/410─► drop stored copy ─► None
//!               ─error─► stale L2 value if any, else None
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::{system_clock, SharedClock};
use super::entry::{CacheKey, CacheValue};
use super::l1::{MemoryConfig, MemoryTier};
use super::l2::{DiskConfig, DiskHit, DiskTier};
use super::l3::{
    FetchOutcome, FreshnessDecision, HttpTransport, JsonDecoder, NetworkConfig,
    NetworkValidationTier, ReqwestTransport, ResponseDecoder, ValidationMetadata,
};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use crate::config::CacheConfig;
use crate::error::Result;

/// Cache tier enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// L1 - process memory
    L1,
    /// L2 - local disk
    L2,
    /// L3 - origin over HTTP
    L3,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (memory)"),
            CacheTier::L2 => write!(f, "L2 (disk)"),
            CacheTier::L3 => write!(f, "L3 (network)"),
        }
    }
}

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheResult<V> {
    /// The cached value
    pub value: V,
    /// Tier whose bytes were returned
    pub tier: CacheTier,
    /// Lookup latency
    pub latency: Duration,
}

/// Unified multi-tier cache
pub struct CacheCoordinator<V> {
    /// L1 (memory) tier
    memory: MemoryTier<V>,
    /// L2 (disk) tier
    disk: Option<DiskTier<V>>,
    /// L3 (network validation) tier
    network: Option<NetworkValidationTier<V>>,
    /// Time source shared by all tiers
    clock: SharedClock,
    /// Metrics collector
    metrics: Arc<CacheMetrics>,
}

impl<V: CacheValue> CacheCoordinator<V> {
    /// Start building a coordinator
    pub fn builder() -> CacheCoordinatorBuilder<V> {
        CacheCoordinatorBuilder::new()
    }

    /// Memory-only cache with the given entry capacity
    pub fn in_memory(capacity: usize) -> Result<Self> {
        Self::builder()
            .memory(MemoryConfig {
                capacity,
                ..Default::default()
            })
            .build()
    }

    /// Build from configuration, using reqwest and JSON bodies for L3
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = Self::builder().memory(config.memory.clone());
        if let Some(disk) = &config.disk {
            builder = builder.disk(disk.clone());
        }
        if let Some(network) = &config.network {
            let transport = Arc::new(ReqwestTransport::new(network)?);
            builder = builder.network(network.clone(), transport, Arc::new(JsonDecoder));
        }
        builder.build()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value from the first tier that has it
    ///
    /// Errors are logged and read as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<V> {
        self.lookup(key).await.map(|result| result.value)
    }

    /// Get a value with the tier it came from
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheResult<V>> {
        match self.get_with(key, &CancellationToken::new()).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Cancellable lookup
    ///
    /// Only cancellation and deadlines are returned as errors; every other
    /// tier failure degrades to a miss at that tier.
    pub async fn get_with(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Result<Option<CacheResult<V>>> {
        let start = Instant::now();

        // Try L1 first
        let tracker = LatencyTracker::start();
        if let Some(value) = self.memory.get(key) {
            self.metrics.record_l1_hit();
            self.metrics.record_l1_read_latency(tracker.elapsed());
            return Ok(Some(CacheResult {
                value,
                tier: CacheTier::L1,
                latency: start.elapsed(),
            }));
        }
        self.metrics.record_l1_miss();

        // Try L2
        let mut stale = None;
        if let Some(disk) = &self.disk {
            let tracker = LatencyTracker::start();
            match disk.get_entry_with(key, cancel).await {
                Ok(Some(hit)) => {
                    self.metrics.record_l2_read_latency(tracker.elapsed());
                    if self.freshness(key, &hit) != FreshnessDecision::Stale {
                        self.metrics.record_l2_hit();
                        self.backfill_memory(key, &hit.value, self.backfill_ttl(&hit));
                        return Ok(Some(CacheResult {
                            value: hit.value,
                            tier: CacheTier::L2,
                            latency: start.elapsed(),
                        }));
                    }
                    self.metrics.record_l2_miss();
                    stale = Some(hit);
                }
                Ok(None) => self.metrics.record_l2_miss(),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    self.metrics.record_l2_miss();
                    warn!(key = %key, error = %e, "L2 read failed, treating as miss");
                }
            }
        }

        // Try L3
        let Some(network) = &self.network else {
            return Ok(None);
        };
        let cached = stale.as_ref().and_then(|hit| hit.validation.as_ref());

        self.metrics.record_l3_fetch();
        let tracker = LatencyTracker::start();
        let outcome = network.fetch(key, cached, cancel).await;
        self.metrics.record_l3_read_latency(tracker.elapsed());

        let served = match outcome {
            Ok(FetchOutcome::Fetched {
                value,
                metadata: Some(metadata),
            }) => {
                self.metrics.record_l3_hit();
                self.backfill_disk(key, &value, metadata.clone(), cancel)
                    .await?;
                let remaining = metadata.remaining(self.clock.now());
                self.backfill_memory(key, &value, Some(remaining));
                Some((value, CacheTier::L3))
            }
            Ok(FetchOutcome::Fetched {
                value,
                metadata: None,
            }) => {
                self.metrics.record_l3_hit();
                if stale.is_some() {
                    self.drop_stored(key).await;
                }
                debug!(key = %key, "Origin response not cacheable");
                Some((value, CacheTier::L3))
            }
            Ok(FetchOutcome::NotModified { metadata }) => match stale {
                Some(hit) => {
                    self.metrics.record_l3_not_modified();
                    self.refresh_validation(key, &hit, metadata).await;
                    Some((hit.value, CacheTier::L2))
                }
                None => {
                    self.metrics.record_l3_miss();
                    warn!(key = %key, "Unconditional request answered 304");
                    None
                }
            },
            Ok(FetchOutcome::Gone) => {
                self.metrics.record_l3_miss();
                if stale.is_some() {
                    self.drop_stored(key).await;
                }
                None
            }
            Ok(FetchOutcome::Failed { status }) => {
                self.metrics.record_l3_error();
                warn!(key = %key, %status, "Origin request failed");
                self.serve_stale(stale)
            }
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                self.metrics.record_l3_error();
                warn!(key = %key, error = %e, "Origin request failed");
                self.serve_stale(stale)
            }
        };

        Ok(served.map(|(value, tier)| CacheResult {
            value,
            tier,
            latency: start.elapsed(),
        }))
    }

    fn freshness(&self, key: &CacheKey, hit: &DiskHit<V>) -> FreshnessDecision {
        match &self.network {
            Some(network) => network.validate(key, hit.validation.as_ref()),
            None => FreshnessDecision::Unknown,
        }
    }

    /// L1 lifetime for a value read from L2: the tighter of its disk TTL
    /// and its remaining network freshness
    fn backfill_ttl(&self, hit: &DiskHit<V>) -> Option<Duration> {
        let freshness = hit
            .validation
            .as_ref()
            .map(|v| v.remaining(self.clock.now()));
        min_ttl(hit.remaining_ttl, freshness)
    }

    fn backfill_memory(&self, key: &CacheKey, value: &V, ttl: Option<Duration>) {
        if ttl == Some(Duration::ZERO) {
            debug!(key = %key, "Skipping L1 backfill of entry without remaining lifetime");
            return;
        }
        match self.memory.put(key.clone(), value.clone(), ttl) {
            Ok(()) => self.metrics.record_backfill_l1(),
            Err(e) => warn!(key = %key, error = %e, "L1 backfill failed"),
        }
    }

    async fn backfill_disk(
        &self,
        key: &CacheKey,
        value: &V,
        metadata: ValidationMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(disk) = &self.disk else {
            return Ok(());
        };
        match disk
            .put_validated(key.clone(), value, None, metadata, cancel)
            .await
        {
            Ok(()) => {
                self.metrics.record_backfill_l2();
                Ok(())
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                self.metrics.record_l2_write_failure();
                warn!(key = %key, error = %e, "L2 backfill failed");
                Ok(())
            }
        }
    }

    async fn refresh_validation(
        &self,
        key: &CacheKey,
        hit: &DiskHit<V>,
        metadata: ValidationMetadata,
    ) {
        let remaining = metadata.remaining(self.clock.now());
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.update_validation(key, metadata).await {
                warn!(key = %key, error = %e, "Failed to persist refreshed validators");
            }
        }
        self.backfill_memory(key, &hit.value, min_ttl(hit.remaining_ttl, Some(remaining)));
    }

    async fn drop_stored(&self, key: &CacheKey) {
        self.memory.remove(key);
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.remove(key).await {
                warn!(key = %key, error = %e, "Failed to drop stored copy");
            }
        }
    }

    fn serve_stale(&self, stale: Option<DiskHit<V>>) -> Option<(V, CacheTier)> {
        match stale {
            Some(hit) => {
                self.metrics.record_stale_served();
                Some((hit.value, CacheTier::L2))
            }
            None => {
                self.metrics.record_l3_miss();
                None
            }
        }
    }

    /// Check if a live entry exists in L1 or L2
    pub async fn contains(&self, key: &CacheKey) -> bool {
        if self.memory.contains(key) {
            return true;
        }
        match &self.disk {
            Some(disk) => disk.contains(key).await.unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "L2 contains check failed");
                false
            }),
            None => false,
        }
    }

    /// Number of distinct live keys across L1 and L2
    pub async fn size(&self) -> usize {
        let mut keys: HashSet<CacheKey> = self.memory.keys().into_iter().collect();
        if let Some(disk) = &self.disk {
            match disk.keys().await {
                Ok(stored) => keys.extend(stored),
                Err(e) => warn!(error = %e, "L2 key listing failed"),
            }
        }
        keys.len()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a value to every storage tier
    pub async fn put(&self, key: CacheKey, value: V, ttl: Option<Duration>) -> Result<()> {
        self.put_with(key, value, ttl, &CancellationToken::new())
            .await
    }

    /// Cancellable `put`
    ///
    /// L2 is written first. An L2 failure is logged and counted; the write
    /// still succeeds once L1 accepts it.
    pub async fn put_with(
        &self,
        key: CacheKey,
        value: V,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tracker = LatencyTracker::start();

        if let Some(disk) = &self.disk {
            match disk.put_with(key.clone(), &value, ttl, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    self.metrics.record_l2_write_failure();
                    warn!(key = %key, error = %e, "L2 write failed, continuing with L1");
                    // An older copy must not outlive the new L1 value
                    if let Err(e) = disk.remove(&key).await {
                        warn!(key = %key, error = %e, "Failed to drop outdated L2 copy");
                    }
                }
            }
        }

        self.memory.put(key, value, ttl)?;
        self.metrics.record_write_latency(tracker.elapsed());
        Ok(())
    }

    /// Remove a key from every tier
    ///
    /// All tiers are attempted; the first error is returned afterwards.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut removed = self.memory.remove(key);

        if let Some(disk) = &self.disk {
            match disk.remove(key).await {
                Ok(found) => removed |= found,
                Err(e) => {
                    warn!(key = %key, error = %e, "L2 remove failed");
                    return Err(e);
                }
            }
        }
        Ok(removed)
    }

    /// Clear every tier
    pub async fn clear(&self) -> Result<()> {
        self.memory.clear();
        if let Some(disk) = &self.disk {
            disk.clear().await?;
        }
        info!("Cache cleared");
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load the disk index; other operations initialize lazily as well
    pub async fn init(&self) -> Result<()> {
        if let Some(disk) = &self.disk {
            disk.init().await?;
        }
        Ok(())
    }

    /// Release memory and flush pending disk bookkeeping
    pub async fn dispose(&self) -> Result<()> {
        self.memory.dispose();
        if let Some(disk) = &self.disk {
            disk.dispose().await?;
        }
        Ok(())
    }

    /// Drop expired entries from L1 and L2
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut purged = self.memory.purge_expired();
        if let Some(disk) = &self.disk {
            purged += disk.purge_expired().await?;
        }
        Ok(purged)
    }

    /// Periodically purge expired entries until `token` is cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Expiry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match cache.purge_expired().await {
                            Ok(0) => {}
                            Ok(purged) => debug!(purged, "Swept expired entries"),
                            Err(e) => warn!(error = %e, "Expiry sweep failed"),
                        }
                    }
                }
            }
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get metrics snapshot with fresh occupancy gauges
    pub async fn metrics(&self) -> MetricsSnapshot {
        let (l2_entries, l2_bytes) = match &self.disk {
            Some(disk) => match disk.stats().await {
                Ok(stats) => (stats.entries as u64, stats.occupied_bytes),
                Err(e) => {
                    warn!(error = %e, "L2 stats unavailable");
                    (0, 0)
                }
            },
            None => (0, 0),
        };
        self.metrics
            .update_occupancy(self.memory.len() as u64, l2_entries, l2_bytes);
        self.metrics.snapshot()
    }

    /// Shared metrics collector
    pub fn metrics_handle(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Get reference to L1
    pub fn memory(&self) -> &MemoryTier<V> {
        &self.memory
    }

    /// Get reference to L2
    pub fn disk(&self) -> Option<&DiskTier<V>> {
        self.disk.as_ref()
    }

    /// Get reference to L3
    pub fn network(&self) -> Option<&NetworkValidationTier<V>> {
        self.network.as_ref()
    }
}

impl<V> std::fmt::Debug for CacheCoordinator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("disk", &self.disk)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

fn min_ttl(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for `CacheCoordinator`
pub struct CacheCoordinatorBuilder<V> {
    memory: MemoryConfig,
    disk: Option<DiskConfig>,
    network: Option<NetworkParts<V>>,
    clock: SharedClock,
    metrics: Option<Arc<CacheMetrics>>,
}

struct NetworkParts<V> {
    config: NetworkConfig,
    transport: Arc<dyn HttpTransport>,
    decoder: Arc<dyn ResponseDecoder<V>>,
}

impl<V: CacheValue> CacheCoordinatorBuilder<V> {
    /// Memory-only LRU defaults on the system clock
    pub fn new() -> Self {
        Self {
            memory: MemoryConfig::default(),
            disk: None,
            network: None,
            clock: system_clock(),
            metrics: None,
        }
    }

    /// Set L1 configuration
    pub fn memory(mut self, config: MemoryConfig) -> Self {
        self.memory = config;
        self
    }

    /// Enable L2
    pub fn disk(mut self, config: DiskConfig) -> Self {
        self.disk = Some(config);
        self
    }

    /// Enable L3 with an explicit transport and body decoder
    pub fn network(
        mut self,
        config: NetworkConfig,
        transport: Arc<dyn HttpTransport>,
        decoder: Arc<dyn ResponseDecoder<V>>,
    ) -> Self {
        self.network = Some(NetworkParts {
            config,
            transport,
            decoder,
        });
        self
    }

    /// Use a specific clock for every tier
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share an existing metrics collector
    pub fn metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Construct the tiers
    ///
    /// Fails with a capacity or configuration error; no I/O happens here.
    pub fn build(self) -> Result<CacheCoordinator<V>> {
        let memory = MemoryTier::new(&self.memory, self.clock.clone())?;
        let disk = self
            .disk
            .map(|config| DiskTier::new(config, self.clock.clone()))
            .transpose()?;
        let network = self.network.map(|parts| {
            NetworkValidationTier::new(
                parts.config,
                parts.transport,
                parts.decoder,
                self.clock.clone(),
            )
        });

        Ok(CacheCoordinator {
            memory,
            disk,
            network,
            clock: self.clock,
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

impl<V: CacheValue> Default for CacheCoordinatorBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
