//! Cache Metrics Collection
//!
//! Coordinator-level counters for monitoring cache health, with a
//! Prometheus text rendering for scraping or CLI output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::Result;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // L1 metrics
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l1_entries: AtomicU64,

    // L2 metrics
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_entries: AtomicU64,
    l2_size_bytes: AtomicU64,
    l2_write_failures: AtomicU64,

    // L3 metrics
    l3_fetches: AtomicU64,
    l3_hits: AtomicU64,
    l3_not_modified: AtomicU64,
    l3_misses: AtomicU64,
    l3_errors: AtomicU64,
    stale_served: AtomicU64,

    // Backfill
    backfills_l1: AtomicU64,
    backfills_l2: AtomicU64,

    // Operation latencies (microseconds, exponential moving average)
    l1_read_latency_us: AtomicU64,
    l2_read_latency_us: AtomicU64,
    l3_read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // L1 metrics
    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn l1_hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed)
    }

    pub fn l1_misses(&self) -> u64 {
        self.l1_misses.load(Ordering::Relaxed)
    }

    pub fn l1_hit_ratio(&self) -> f64 {
        ratio(self.l1_hits(), self.l1_misses())
    }

    // L2 metrics
    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_write_failure(&self) {
        self.l2_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn l2_hits(&self) -> u64 {
        self.l2_hits.load(Ordering::Relaxed)
    }

    pub fn l2_misses(&self) -> u64 {
        self.l2_misses.load(Ordering::Relaxed)
    }

    pub fn l2_hit_ratio(&self) -> f64 {
        ratio(self.l2_hits(), self.l2_misses())
    }

    /// Refresh occupancy gauges
    pub fn update_occupancy(&self, l1_entries: u64, l2_entries: u64, l2_size_bytes: u64) {
        self.l1_entries.store(l1_entries, Ordering::Relaxed);
        self.l2_entries.store(l2_entries, Ordering::Relaxed);
        self.l2_size_bytes.store(l2_size_bytes, Ordering::Relaxed);
    }

    // L3 metrics
    pub fn record_l3_fetch(&self) {
        self.l3_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l3_hit(&self) {
        self.l3_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l3_not_modified(&self) {
        self.l3_not_modified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l3_miss(&self) {
        self.l3_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l3_error(&self) {
        self.l3_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn l3_hits(&self) -> u64 {
        self.l3_hits.load(Ordering::Relaxed)
    }

    pub fn l3_misses(&self) -> u64 {
        self.l3_misses.load(Ordering::Relaxed)
    }

    // Backfill tracking
    pub fn record_backfill_l1(&self) {
        self.backfills_l1.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill_l2(&self) {
        self.backfills_l2.fetch_add(1, Ordering::Relaxed);
    }

    // Latency tracking
    pub fn record_l1_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.l1_read_latency_us, duration);
    }

    pub fn record_l2_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.l2_read_latency_us, duration);
    }

    pub fn record_l3_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.l3_read_latency_us, duration);
    }

    pub fn record_write_latency(&self, duration: Duration) {
        update_latency_ema(&self.write_latency_us, duration);
    }

    /// Get overall cache hit ratio
    ///
    /// A lookup is a miss only when it left the cache empty-handed.
    pub fn overall_hit_ratio(&self) -> f64 {
        let total_hits = self.l1_hits()
            + self.l2_hits()
            + self.l3_hits()
            + self.l3_not_modified.load(Ordering::Relaxed);
        ratio(total_hits, self.l3_misses())
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let latency = |c: &AtomicU64| Duration::from_micros(c.load(Ordering::Relaxed));

        MetricsSnapshot {
            l1_hits: self.l1_hits(),
            l1_misses: self.l1_misses(),
            l1_entries: load(&self.l1_entries),
            l1_hit_ratio: self.l1_hit_ratio(),
            l1_read_latency: latency(&self.l1_read_latency_us),

            l2_hits: self.l2_hits(),
            l2_misses: self.l2_misses(),
            l2_entries: load(&self.l2_entries),
            l2_size_bytes: load(&self.l2_size_bytes),
            l2_write_failures: load(&self.l2_write_failures),
            l2_hit_ratio: self.l2_hit_ratio(),
            l2_read_latency: latency(&self.l2_read_latency_us),

            l3_fetches: load(&self.l3_fetches),
            l3_hits: self.l3_hits(),
            l3_not_modified: load(&self.l3_not_modified),
            l3_misses: self.l3_misses(),
            l3_errors: load(&self.l3_errors),
            stale_served: load(&self.stale_served),
            l3_read_latency: latency(&self.l3_read_latency_us),

            backfills_l1: load(&self.backfills_l1),
            backfills_l2: load(&self.backfills_l2),
            write_latency: latency(&self.write_latency_us),

            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.l1_hits,
            &self.l1_misses,
            &self.l2_hits,
            &self.l2_misses,
            &self.l2_write_failures,
            &self.l3_fetches,
            &self.l3_hits,
            &self.l3_not_modified,
            &self.l3_misses,
            &self.l3_errors,
            &self.stale_served,
            &self.backfills_l1,
            &self.backfills_l2,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    // L1
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_entries: u64,
    pub l1_hit_ratio: f64,
    pub l1_read_latency: Duration,

    // L2
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_entries: u64,
    pub l2_size_bytes: u64,
    pub l2_write_failures: u64,
    pub l2_hit_ratio: f64,
    pub l2_read_latency: Duration,

    // L3
    pub l3_fetches: u64,
    pub l3_hits: u64,
    pub l3_not_modified: u64,
    pub l3_misses: u64,
    pub l3_errors: u64,
    pub stale_served: u64,
    pub l3_read_latency: Duration,

    // Tier movement
    pub backfills_l1: u64,
    pub backfills_l2: u64,
    pub write_latency: Duration,

    // Overall
    pub overall_hit_ratio: f64,
}

impl MetricsSnapshot {
    /// Render the snapshot in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> Result<String> {
        let registry = Registry::new();

        let lookups = IntCounterVec::new(
            Opts::new("tiered_cache_lookups_total", "Cache lookups by tier and outcome"),
            &["tier", "outcome"],
        )?;
        let backfills = IntCounterVec::new(
            Opts::new("tiered_cache_backfills_total", "Values written back into a faster tier"),
            &["tier"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("tiered_cache_failures_total", "Recovered tier failures"),
            &["kind"],
        )?;
        let occupancy = IntGaugeVec::new(
            Opts::new("tiered_cache_entries", "Live entries per storage tier"),
            &["tier"],
        )?;
        let latency = IntGaugeVec::new(
            Opts::new(
                "tiered_cache_read_latency_microseconds",
                "Smoothed read latency per tier",
            ),
            &["tier"],
        )?;

        registry.register(Box::new(lookups.clone()))?;
        registry.register(Box::new(backfills.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(occupancy.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        for (tier, outcome, value) in [
            ("l1", "hit", self.l1_hits),
            ("l1", "miss", self.l1_misses),
            ("l2", "hit", self.l2_hits),
            ("l2", "miss", self.l2_misses),
            ("l3", "hit", self.l3_hits),
            ("l3", "not_modified", self.l3_not_modified),
            ("l3", "miss", self.l3_misses),
            ("l3", "stale_served", self.stale_served),
        ] {
            lookups.with_label_values(&[tier, outcome]).inc_by(value);
        }

        backfills.with_label_values(&["l1"]).inc_by(self.backfills_l1);
        backfills.with_label_values(&["l2"]).inc_by(self.backfills_l2);

        failures
            .with_label_values(&["l2_write"])
            .inc_by(self.l2_write_failures);
        failures.with_label_values(&["network"]).inc_by(self.l3_errors);

        occupancy.with_label_values(&["l1"]).set(self.l1_entries as i64);
        occupancy.with_label_values(&["l2"]).set(self.l2_entries as i64);

        for (tier, value) in [
            ("l1", self.l1_read_latency),
            ("l2", self.l2_read_latency),
            ("l3", self.l3_read_latency),
        ] {
            latency
                .with_label_values(&[tier])
                .set(value.as_micros() as i64);
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
