//! L2 Cache - Persistent Disk Tier
//!
//! One value file per entry plus a JSON metadata index, all under a single
//! directory.
//!
//! # Layout
//!
//! ```text
//! <directory>/
//!   metadata.json            index: key -> IndexEntry
//!   <sha256(key)>.<id>.bin   serialized (optionally LZ4-compressed) value
//!   <sha256(key)>.<id>.tmp   in-flight write, never referenced by the index
//! ```
//!
//! # Design
//!
//! - Every write gets its own `<id>`, so a committed file is never
//!   overwritten. Writes go temp file → fsync → rename → index update →
//!   index persist (itself temp + rename); the previous file is deleted
//!   only once the index names the new one
//! - A failure or cancellation before the index is persisted leaves the
//!   key at its previous value, or absent if it had none
//! - `init` drops index entries without a matching file and deletes
//!   orphaned value files and stale temp files
//! - Reads verify the SHA-256 checksum recorded in the index
//! - Hysteresis eviction by ascending `last_accessed` down to
//!   `target_ratio * capacity`
//! - Unreadable or undecodable files evict only their own key and read as
//!   a miss
//! - Read bookkeeping is flushed lazily with the next index write

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{self, SharedClock};
use super::compression::{Codec, CompressionAlgorithm, CompressionConfig};
use super::entry::{CacheKey, CacheValue};
use super::l3::ValidationMetadata;
use super::{DEFAULT_L2_CAPACITY, DEFAULT_L2_TARGET_RATIO};
use crate::error::{Error, Result};

/// Index file name inside the cache directory
pub const INDEX_FILE: &str = "metadata.json";

/// Current index format version
pub const INDEX_VERSION: u32 = 1;

const VALUE_EXTENSION: &str = "bin";
const TEMP_EXTENSION: &str = "tmp";

/// L2 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Cache directory path
    pub directory: PathBuf,
    /// Maximum occupied bytes
    pub capacity_bytes: u64,
    /// Fraction of capacity eviction drains down to
    pub target_ratio: f64,
    /// TTL applied when `put` is called without one (seconds)
    pub default_ttl_secs: Option<u64>,
    /// Deadline for a single operation (milliseconds)
    pub op_timeout_ms: Option<u64>,
    /// Value file compression
    pub compression: CompressionConfig,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".tiered-cache"),
            capacity_bytes: DEFAULT_L2_CAPACITY,
            target_ratio: DEFAULT_L2_TARGET_RATIO,
            default_ttl_secs: None,
            op_timeout_ms: None,
            compression: CompressionConfig::default(),
        }
    }
}

impl DiskConfig {
    /// Configuration rooted at `directory` with defaults elsewhere
    pub fn at(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// Per-operation deadline
    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_ms.map(Duration::from_millis)
    }
}

/// Index record for one stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Value file name relative to the cache directory
    pub file_path: String,
    /// Bytes on disk
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Time to live, absent means the entry never expires
    pub ttl_millis: Option<u64>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    /// SHA-256 of the file contents, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Network validators for values fetched from an origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationMetadata>,
}

impl IndexEntry {
    /// Entry-specific time to live
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_millis.map(Duration::from_millis)
    }

    /// Check if the entry has expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl() {
            Some(ttl) => clock::elapsed(now, self.created_at) > ttl,
            None => false,
        }
    }

    /// Time left before expiry
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.ttl()
            .map(|ttl| ttl.saturating_sub(clock::elapsed(now, self.created_at)))
    }
}

/// Persisted metadata index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataIndex {
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<CacheKey, IndexEntry>,
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl MetadataIndex {
    /// Total bytes referenced by the index
    pub fn occupied(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}

/// A value read from disk with its bookkeeping
#[derive(Debug, Clone)]
pub struct DiskHit<V> {
    pub value: V,
    pub created_at: DateTime<Utc>,
    /// Time left before expiry, `None` when it never expires
    pub remaining_ttl: Option<Duration>,
    /// Network validators, `None` for locally written values
    pub validation: Option<ValidationMetadata>,
}

struct DiskState {
    index: MetadataIndex,
    occupied: u64,
    /// In-memory index differs from metadata.json
    dirty: bool,
    /// Index has been loaded and reconciled
    ready: bool,
}

/// Cancellation and deadline for one operation
struct OpContext<'a> {
    cancel: &'a CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl OpContext<'_> {
    fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Err(Error::Timeout(limit)),
            _ => Ok(()),
        }
    }

    /// Run one step, abandoning it on cancellation or deadline
    async fn run<T, F>(&self, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let expired = async {
            match self.deadline {
                Some((at, limit)) => {
                    tokio::time::sleep_until(at).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            limit = expired => Err(Error::Timeout(limit)),
            result = step => result,
        }
    }
}

/// Points in a write where tests cancel the operation
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStep {
    /// Temp file synced, not yet renamed
    TempWritten,
    /// Value file renamed into place, index not yet persisted
    Renamed,
}

/// L2 Cache - persistent disk tier
pub struct DiskTier<V> {
    config: DiskConfig,
    codec: Codec,
    clock: SharedClock,
    state: Mutex<DiskState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    corruptions: AtomicU64,
    expirations: AtomicU64,
    #[cfg(test)]
    cancel_at: parking_lot::Mutex<Option<WriteStep>>,
    _value: PhantomData<fn() -> V>,
}

impl<V: CacheValue> DiskTier<V> {
    /// Create a disk tier; nothing touches the filesystem until `init`
    pub fn new(config: DiskConfig, clock: SharedClock) -> Result<Self> {
        if config.capacity_bytes == 0 {
            return Err(Error::Capacity(
                "disk tier capacity must be at least one byte".into(),
            ));
        }
        if !(config.target_ratio > 0.0 && config.target_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "disk target_ratio must be in (0, 1], got {}",
                config.target_ratio
            )));
        }

        Ok(Self {
            codec: Codec::new(config.compression),
            config,
            clock,
            state: Mutex::new(DiskState {
                index: MetadataIndex::default(),
                occupied: 0,
                dirty: false,
                ready: false,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            #[cfg(test)]
            cancel_at: parking_lot::Mutex::new(None),
            _value: PhantomData,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Cache directory
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Committed value file of a key, `None` if the key is not indexed
    pub async fn value_path(&self, key: &CacheKey) -> Result<Option<PathBuf>> {
        let state = self.lock_ready().await?;
        Ok(state
            .index
            .entries
            .get(key)
            .map(|e| self.config.directory.join(&e.file_path)))
    }

    fn index_path(&self) -> PathBuf {
        self.config.directory.join(INDEX_FILE)
    }

    fn context<'a>(&self, cancel: &'a CancellationToken) -> OpContext<'a> {
        OpContext {
            cancel,
            deadline: self
                .config
                .op_timeout()
                .map(|limit| (Instant::now() + limit, limit)),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load or create the index and reconcile it with the directory
    ///
    /// Idempotent; every other operation initializes lazily.
    pub async fn init(&self) -> Result<()> {
        self.lock_ready().await.map(drop)
    }

    /// Flush pending bookkeeping and release the loaded index
    pub async fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.ready {
            return Ok(());
        }
        if state.dirty {
            self.persist(&state.index).await?;
        }
        state.index = MetadataIndex::default();
        state.occupied = 0;
        state.dirty = false;
        state.ready = false;
        debug!(directory = %self.config.directory.display(), "L2 disposed");
        Ok(())
    }

    /// Persist access bookkeeping not yet written to the index
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.ready && state.dirty {
            self.persist(&state.index).await?;
            state.dirty = false;
        }
        Ok(())
    }

    async fn lock_ready(&self) -> Result<MutexGuard<'_, DiskState>> {
        let mut state = self.state.lock().await;
        if !state.ready {
            self.load(&mut state).await?;
        }
        Ok(state)
    }

    async fn load(&self, state: &mut DiskState) -> Result<()> {
        let directory = &self.config.directory;
        fs::create_dir_all(directory)
            .await
            .map_err(|e| Error::io(directory, e))?;

        let index_path = self.index_path();
        let mut changed = false;
        let mut index = match fs::read(&index_path).await {
            Ok(bytes) => match serde_json::from_slice::<MetadataIndex>(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    warn!(path = %index_path.display(), error = %e, "Corrupt cache index, starting empty");
                    changed = true;
                    MetadataIndex::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                changed = true;
                MetadataIndex::default()
            }
            Err(e) => return Err(Error::io(&index_path, e)),
        };

        if index.version != INDEX_VERSION {
            index.version = INDEX_VERSION;
            changed = true;
        }

        // Entries must point at one of their own value files with the recorded size
        let mut dropped = 0usize;
        let keys: Vec<CacheKey> = index.entries.keys().cloned().collect();
        for key in keys {
            let valid = match index.entries.get(&key) {
                Some(entry) if owns_file(&key, &entry.file_path) => {
                    match fs::metadata(directory.join(&entry.file_path)).await {
                        Ok(meta) => meta.is_file() && meta.len() == entry.size_bytes,
                        Err(_) => false,
                    }
                }
                _ => false,
            };
            if !valid {
                index.entries.remove(&key);
                dropped += 1;
            }
        }

        let referenced: HashSet<&str> = index
            .entries
            .values()
            .map(|e| e.file_path.as_str())
            .collect();

        let mut removed = 0usize;
        let mut listing = fs::read_dir(directory)
            .await
            .map_err(|e| Error::io(directory, e))?;
        while let Some(item) = listing
            .next_entry()
            .await
            .map_err(|e| Error::io(directory, e))?
        {
            let name = item.file_name().to_string_lossy().into_owned();
            let stale = name.ends_with(&format!(".{}", TEMP_EXTENSION))
                || (name.ends_with(&format!(".{}", VALUE_EXTENSION))
                    && !referenced.contains(name.as_str()));
            if stale {
                remove_quietly(&item.path()).await;
                removed += 1;
            }
        }

        state.occupied = index.occupied();
        state.index = index;
        state.dirty = false;

        if changed || dropped > 0 {
            self.persist(&state.index).await?;
        }
        state.ready = true;

        info!(
            directory = %directory.display(),
            entries = state.index.entries.len(),
            occupied_bytes = state.occupied,
            dropped,
            removed,
            "L2 initialized"
        );
        Ok(())
    }

    async fn persist(&self, index: &MetadataIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        let index_path = self.index_path();
        let temp_path = self.config.directory.join(format!(
            "{}.{}.{}",
            INDEX_FILE,
            Uuid::new_v4().simple(),
            TEMP_EXTENSION
        ));

        if let Err(e) = write_synced(&temp_path, &bytes).await {
            remove_quietly(&temp_path).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp_path, &index_path).await {
            remove_quietly(&temp_path).await;
            return Err(Error::io(&index_path, e));
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value
    pub async fn get(&self, key: &CacheKey) -> Result<Option<V>> {
        Ok(self.get_entry(key).await?.map(|hit| hit.value))
    }

    /// Get a value with its TTL and validators
    pub async fn get_entry(&self, key: &CacheKey) -> Result<Option<DiskHit<V>>> {
        self.get_entry_with(key, &CancellationToken::new()).await
    }

    /// Cancellable `get_entry`
    ///
    /// Expired, unreadable and undecodable entries are removed and read as
    /// a miss. Only cancellation, deadlines and index failures are errors.
    pub async fn get_entry_with(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Result<Option<DiskHit<V>>> {
        let ctx = self.context(cancel);
        let mut state = ctx.run(self.lock_ready()).await?;
        let now = self.clock.now();

        let Some(entry) = state.index.entries.get(key).cloned() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if entry.is_expired(now) {
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.discard(&mut state, key).await;
            return Ok(None);
        }

        let path = self.config.directory.join(&entry.file_path);
        let read = ctx
            .run(async { fs::read(&path).await.map_err(|e| Error::io(&path, e)) })
            .await;

        let decoded = match read {
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => Err(e),
            Ok(bytes) if bytes.len() as u64 != entry.size_bytes => Err(Error::corruption(
                key.as_str(),
                format!(
                    "file holds {} bytes, index records {}",
                    bytes.len(),
                    entry.size_bytes
                ),
            )),
            Ok(bytes) => match &entry.checksum {
                Some(expected) if *expected != payload_checksum(&bytes) => Err(
                    Error::corruption(key.as_str(), "file contents do not match the index checksum"),
                ),
                _ => self.decode(&bytes, entry.compression),
            },
        };

        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                if e.is_local_to_key() {
                    self.corruptions.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Dropping corrupt L2 entry");
                } else {
                    warn!(key = %key, error = %e, "Dropping unreadable L2 entry");
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.discard(&mut state, key).await;
                return Ok(None);
            }
        };

        if let Some(stored) = state.index.entries.get_mut(key) {
            stored.last_accessed = now;
            stored.access_count += 1;
        }
        state.dirty = true;
        self.hits.fetch_add(1, Ordering::Relaxed);

        Ok(Some(DiskHit {
            value,
            created_at: entry.created_at,
            remaining_ttl: entry.remaining_ttl(now),
            validation: entry.validation,
        }))
    }

    fn decode(&self, bytes: &[u8], compression: CompressionAlgorithm) -> Result<V> {
        let raw = self.codec.decode(bytes, compression)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Check if a live entry exists without reading its file
    pub async fn contains(&self, key: &CacheKey) -> Result<bool> {
        let state = self.lock_ready().await?;
        let now = self.clock.now();
        Ok(state
            .index
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now)))
    }

    /// Number of live entries
    pub async fn len(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    /// Check if the tier holds no live entries
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Live keys
    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        let state = self.lock_ready().await?;
        let now = self.clock.now();
        Ok(state
            .index
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// Bytes referenced by the index
    pub async fn occupied_bytes(&self) -> Result<u64> {
        Ok(self.lock_ready().await?.occupied)
    }

    /// Get capacity
    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value
    pub async fn put(&self, key: CacheKey, value: &V, ttl: Option<Duration>) -> Result<()> {
        self.put_with(key, value, ttl, &CancellationToken::new())
            .await
    }

    /// Cancellable `put`
    pub async fn put_with(
        &self,
        key: CacheKey,
        value: &V,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.write(key, value, ttl, None, cancel).await
    }

    /// Store a value fetched from an origin together with its validators
    pub async fn put_validated(
        &self,
        key: CacheKey,
        value: &V,
        ttl: Option<Duration>,
        validation: ValidationMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.write(key, value, ttl, Some(validation), cancel).await
    }

    async fn write(
        &self,
        key: CacheKey,
        value: &V,
        ttl: Option<Duration>,
        validation: Option<ValidationMetadata>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = self.context(cancel);
        ctx.check()?;

        let raw = serde_json::to_vec(value)?;
        let (payload, compression) = self.codec.encode(&raw);
        let size = payload.len() as u64;
        if size > self.config.capacity_bytes {
            return Err(Error::EntryTooLarge {
                size,
                capacity: self.config.capacity_bytes,
            });
        }

        let mut state = ctx.run(self.lock_ready()).await?;

        let generation = Uuid::new_v4().simple().to_string();
        let file_name = value_file_name(&key, &generation);
        let final_path = self.config.directory.join(&file_name);
        let temp_path = self.config.directory.join(format!(
            "{}.{}.{}",
            key.digest(),
            generation,
            TEMP_EXTENSION
        ));

        if let Err(e) = ctx.run(write_synced(&temp_path, &payload)).await {
            remove_quietly(&temp_path).await;
            return Err(e);
        }
        #[cfg(test)]
        self.reached(WriteStep::TempWritten, cancel);

        let now = self.clock.now();
        let victims = self.plan_eviction(&state, &key, size, now);

        let renamed = ctx
            .run(async {
                fs::rename(&temp_path, &final_path)
                    .await
                    .map_err(|e| Error::io(&final_path, e))
            })
            .await;
        if let Err(e) = renamed {
            // An abandoned rename can still land later; init removes the orphan
            remove_quietly(&temp_path).await;
            remove_quietly(&final_path).await;
            return Err(e);
        }
        #[cfg(test)]
        self.reached(WriteStep::Renamed, cancel);

        let mut evicted = Vec::with_capacity(victims.len());
        for victim in victims {
            if let Some(entry) = state.index.entries.remove(&victim) {
                evicted.push((victim, entry));
            }
        }
        let previous = state.index.entries.insert(
            key.clone(),
            IndexEntry {
                file_path: file_name,
                size_bytes: size,
                created_at: now,
                last_accessed: now,
                ttl_millis: ttl
                    .or(self.config.default_ttl())
                    .map(|d| d.as_millis().min(u64::MAX as u128) as u64),
                access_count: 0,
                compression,
                checksum: Some(payload_checksum(&payload)),
                validation,
            },
        );
        state.occupied = state.index.occupied();

        if let Err(e) = ctx.run(self.persist(&state.index)).await {
            for (victim, entry) in evicted {
                state.index.entries.insert(victim, entry);
            }
            match previous {
                Some(entry) => state.index.entries.insert(key.clone(), entry),
                None => state.index.entries.remove(&key),
            };
            state.occupied = state.index.occupied();
            state.dirty = true;
            remove_quietly(&final_path).await;
            warn!(key = %key, error = %e, "L2 write rolled back");
            return Err(e);
        }
        state.dirty = false;

        if let Some(previous) = &previous {
            remove_quietly(&self.config.directory.join(&previous.file_path)).await;
        }
        for (victim, entry) in &evicted {
            remove_quietly(&self.config.directory.join(&entry.file_path)).await;
            debug!(key = %victim, bytes = entry.size_bytes, "L2 evicted entry");
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);

        debug!(key = %key, bytes = size, %compression, "L2 stored entry");
        Ok(())
    }

    #[cfg(test)]
    fn reached(&self, step: WriteStep, cancel: &CancellationToken) {
        if *self.cancel_at.lock() == Some(step) {
            cancel.cancel();
        }
    }

    /// Keys to evict so `incoming` bytes fit, draining to the target ratio
    ///
    /// Expired entries go first, then ascending `last_accessed`.
    fn plan_eviction(
        &self,
        state: &DiskState,
        key: &CacheKey,
        incoming: u64,
        now: DateTime<Utc>,
    ) -> Vec<CacheKey> {
        let capacity = self.config.capacity_bytes;
        let replaced = state.index.entries.get(key).map_or(0, |e| e.size_bytes);
        let mut occupied = state.occupied.saturating_sub(replaced);

        if occupied + incoming <= capacity {
            return Vec::new();
        }

        let target = (capacity as f64 * self.config.target_ratio) as u64;
        let mut candidates: Vec<(&CacheKey, &IndexEntry)> = state
            .index
            .entries
            .iter()
            .filter(|(k, _)| *k != key)
            .collect();
        candidates.sort_by_key(|(_, e)| (!e.is_expired(now), e.last_accessed));

        let mut victims = Vec::new();
        for (candidate, entry) in candidates {
            if occupied + incoming <= target {
                break;
            }
            occupied = occupied.saturating_sub(entry.size_bytes);
            victims.push(candidate.clone());
        }
        victims
    }

    /// Remove a key after it expired or was found corrupt
    async fn discard(&self, state: &mut DiskState, key: &CacheKey) {
        let Some(entry) = state.index.entries.remove(key) else {
            return;
        };
        state.occupied = state.occupied.saturating_sub(entry.size_bytes);

        match self.persist(&state.index).await {
            Ok(()) => state.dirty = false,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to persist L2 index");
                state.dirty = true;
            }
        }
        remove_quietly(&self.config.directory.join(&entry.file_path)).await;
    }

    /// Replace the validators of a stored value, returning whether it exists
    pub async fn update_validation(
        &self,
        key: &CacheKey,
        validation: ValidationMetadata,
    ) -> Result<bool> {
        let mut state = self.lock_ready().await?;
        let now = self.clock.now();

        match state.index.entries.get_mut(key) {
            Some(entry) => {
                entry.validation = Some(validation);
                entry.last_accessed = now;
            }
            None => return Ok(false),
        }

        if let Err(e) = self.persist(&state.index).await {
            state.dirty = true;
            return Err(e);
        }
        state.dirty = false;
        Ok(true)
    }

    /// Remove a key, returning whether it was present
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        self.remove_with(key, &CancellationToken::new()).await
    }

    /// Cancellable `remove`
    ///
    /// The index is persisted before the file is deleted, so a failure never
    /// leaves the index pointing at a missing file.
    pub async fn remove_with(&self, key: &CacheKey, cancel: &CancellationToken) -> Result<bool> {
        let ctx = self.context(cancel);
        let mut state = ctx.run(self.lock_ready()).await?;

        let Some(entry) = state.index.entries.remove(key) else {
            return Ok(false);
        };

        if let Err(e) = ctx.run(self.persist(&state.index)).await {
            state.index.entries.insert(key.clone(), entry);
            state.dirty = true;
            return Err(e);
        }
        state.occupied = state.occupied.saturating_sub(entry.size_bytes);
        state.dirty = false;

        // Committed; a file left behind is an orphan that init deletes
        remove_quietly(&self.config.directory.join(&entry.file_path)).await;
        Ok(true)
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<()> {
        self.clear_with(&CancellationToken::new()).await
    }

    /// Cancellable `clear`
    pub async fn clear_with(&self, cancel: &CancellationToken) -> Result<()> {
        let ctx = self.context(cancel);
        let mut state = ctx.run(self.lock_ready()).await?;

        let removed = std::mem::take(&mut state.index.entries);
        if let Err(e) = ctx.run(self.persist(&state.index)).await {
            state.index.entries = removed;
            state.dirty = true;
            return Err(e);
        }
        state.occupied = 0;
        state.dirty = false;

        let mut first_error = None;
        for entry in removed.values() {
            let path = self.config.directory.join(&entry.file_path);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete cache file");
                    first_error.get_or_insert(Error::io(path, e));
                }
            }
        }

        info!(entries = removed.len(), "L2 cleared");
        first_error.map_or(Ok(()), Err)
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut state = self.lock_ready().await?;
        let now = self.clock.now();

        let expired: Vec<(CacheKey, IndexEntry)> = state
            .index
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        for (key, _) in &expired {
            state.index.entries.remove(key);
        }
        if let Err(e) = self.persist(&state.index).await {
            for (key, entry) in expired {
                state.index.entries.insert(key, entry);
            }
            state.dirty = true;
            return Err(e);
        }
        state.occupied = state.index.occupied();
        state.dirty = false;

        for (_, entry) in &expired {
            remove_quietly(&self.config.directory.join(&entry.file_path)).await;
        }

        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        debug!(count = expired.len(), "L2 purged expired entries");
        Ok(expired.len())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

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

    /// Entries dropped because their file was unreadable
    pub fn corruptions(&self) -> u64 {
        self.corruptions.load(Ordering::Relaxed)
    }

    /// Get cache statistics
    pub async fn stats(&self) -> Result<DiskStats> {
        let state = self.lock_ready().await?;
        Ok(DiskStats {
            entries: state.index.entries.len(),
            occupied_bytes: state.occupied,
            capacity_bytes: self.config.capacity_bytes,
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            corruptions: self.corruptions(),
            expirations: self.expirations.load(Ordering::Relaxed),
        })
    }
}

impl<V> std::fmt::Debug for DiskTier<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTier")
            .field("directory", &self.config.directory)
            .field("capacity_bytes", &self.config.capacity_bytes)
            .finish()
    }
}

/// L2 cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    /// Number of indexed entries
    pub entries: usize,
    /// Bytes referenced by the index
    pub occupied_bytes: u64,
    /// Capacity in bytes
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub corruptions: u64,
    pub expirations: u64,
}

fn value_file_name(key: &CacheKey, generation: &str) -> String {
    format!("{}.{}.{}", key.digest(), generation, VALUE_EXTENSION)
}

/// Check that an indexed file name is one of the key's value files
fn owns_file(key: &CacheKey, file_name: &str) -> bool {
    let Some(rest) = file_name.strip_prefix(key.digest().as_str()) else {
        return false;
    };
    match rest
        .strip_prefix('.')
        .and_then(|r| r.strip_suffix(&format!(".{}", VALUE_EXTENSION)))
    {
        Some(generation) => {
            !generation.is_empty() && generation.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn payload_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| Error::io(path, e))?;
    file.sync_all().await.map_err(|e| Error::io(path, e))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete cache file");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
