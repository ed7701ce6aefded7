//! Cache Eviction Policies
//!
//! Pluggable strategies deciding which key a full tier gives up.
//!
//! | Policy | Access | Evicts |
//! |--------|--------|--------|
//! | LRU    | move to MRU end, O(1) | least recently used |
//! | LFU    | bump frequency bucket, O(1) | any key of the minimum-frequency bucket |
//! | FIFO   | no-op | oldest insertion |
//! | TTL    | no-op | earliest expiry deadline, non-expiring keys last |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::CacheKey;

/// Eviction policy contract
///
/// Policies only track keys; the owning tier removes the evicted entry.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// Policy name
    fn name(&self) -> &'static str;

    /// Register a newly inserted key. Re-inserting a known key registers it afresh.
    fn record_insert(&mut self, key: &CacheKey, expires_at: Option<DateTime<Utc>>);

    /// Register a successful read
    fn record_access(&mut self, key: &CacheKey);

    /// Choose and forget one key, `None` when nothing is tracked
    fn evict_one(&mut self) -> Option<CacheKey>;

    /// Forget a key
    fn remove(&mut self, key: &CacheKey);

    /// Number of tracked keys
    fn len(&self) -> usize;

    /// Check if no keys are tracked
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every key
    fn clear(&mut self);
}

/// Policy selector used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
    /// First in, first out
    Fifo,
    /// Earliest expiry first
    Ttl,
}

impl PolicyKind {
    /// Build a fresh policy instance
    pub fn build(self) -> Box<dyn EvictionPolicy> {
        match self {
            PolicyKind::Lru => Box::new(LruPolicy::new()),
            PolicyKind::Lfu => Box::new(LfuPolicy::new()),
            PolicyKind::Fifo => Box::new(FifoPolicy::new()),
            PolicyKind::Ttl => Box::new(TtlPolicy::new()),
        }
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::Lru => "lru",
            PolicyKind::Lfu => "lfu",
            PolicyKind::Fifo => "fifo",
            PolicyKind::Ttl => "ttl",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(PolicyKind::Lru),
            "lfu" => Ok(PolicyKind::Lfu),
            "fifo" => Ok(PolicyKind::Fifo),
            "ttl" => Ok(PolicyKind::Ttl),
            other => Err(format!("unknown eviction policy: {}", other)),
        }
    }
}

// =============================================================================
// Order List
// =============================================================================

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: Option<CacheKey>,
    prev: usize,
    next: usize,
}

/// Slab-backed doubly linked list of keys with O(1) lookup by key.
/// Front is the oldest position, back the newest.
#[derive(Debug)]
struct OrderList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    head: usize,
    tail: usize,
}

impl Default for OrderList {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }
}

impl OrderList {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Append a key, or move it to the back if already present
    fn push_back(&mut self, key: &CacheKey) {
        if self.move_to_back(key) {
            return;
        }
        let idx = self.alloc(key.clone());
        self.link_back(idx);
        self.index.insert(key.clone(), idx);
    }

    fn move_to_back(&mut self, key: &CacheKey) -> bool {
        let Some(&idx) = self.index.get(key) else {
            return false;
        };
        if self.tail != idx {
            self.unlink(idx);
            self.link_back(idx);
        }
        true
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        let Some(idx) = self.index.remove(key) else {
            return false;
        };
        self.unlink(idx);
        self.release(idx);
        true
    }

    fn pop_front(&mut self) -> Option<CacheKey> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.unlink(idx);
        let key = self.release(idx)?;
        self.index.remove(&key);
        Some(key)
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    #[cfg(test)]
    fn keys(&self) -> Vec<CacheKey> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while cursor != NIL {
            if let Some(key) = &self.nodes[cursor].key {
                out.push(key.clone());
            }
            cursor = self.nodes[cursor].next;
        }
        out
    }

    fn alloc(&mut self, key: CacheKey) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx].key = Some(key);
                idx
            }
            None => {
                self.nodes.push(Node {
                    key: Some(key),
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Option<CacheKey> {
        self.free.push(idx);
        self.nodes[idx].key.take()
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;

        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn link_back(&mut self, idx: usize) {
        self.nodes[idx].prev = self.tail;
        self.nodes[idx].next = NIL;
        if self.tail != NIL {
            self.nodes[self.tail].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }
}

// =============================================================================
// LRU
// =============================================================================

/// Least-recently-used policy
#[derive(Debug, Default)]
pub struct LruPolicy {
    order: OrderList,
}

impl LruPolicy {
    /// Create an empty LRU policy
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn record_insert(&mut self, key: &CacheKey, _expires_at: Option<DateTime<Utc>>) {
        self.order.push_back(key);
    }

    fn record_access(&mut self, key: &CacheKey) {
        self.order.move_to_back(key);
    }

    fn evict_one(&mut self) -> Option<CacheKey> {
        self.order.pop_front()
    }

    fn remove(&mut self, key: &CacheKey) {
        self.order.remove(key);
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
    }
}

// =============================================================================
// FIFO
// =============================================================================

/// First-in-first-out policy
#[derive(Debug, Default)]
pub struct FifoPolicy {
    order: OrderList,
}

impl FifoPolicy {
    /// Create an empty FIFO policy
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn record_insert(&mut self, key: &CacheKey, _expires_at: Option<DateTime<Utc>>) {
        self.order.remove(key);
        self.order.push_back(key);
    }

    fn record_access(&mut self, _key: &CacheKey) {}

    fn evict_one(&mut self) -> Option<CacheKey> {
        self.order.pop_front()
    }

    fn remove(&mut self, key: &CacheKey) {
        self.order.remove(key);
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
    }
}

// =============================================================================
// LFU
// =============================================================================

/// Least-frequently-used policy
///
/// Keys live in per-frequency buckets; the minimum frequency is tracked so
/// eviction never scans. Which key of the minimum bucket is evicted is
/// unspecified.
#[derive(Debug, Default)]
pub struct LfuPolicy {
    freqs: HashMap<CacheKey, u64>,
    buckets: BTreeMap<u64, OrderList>,
    min_freq: u64,
}

impl LfuPolicy {
    /// Create an empty LFU policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracked minimum frequency, `None` when empty
    pub fn min_frequency(&self) -> Option<u64> {
        if self.freqs.is_empty() {
            None
        } else {
            Some(self.min_freq)
        }
    }

    /// Current frequency of a key
    pub fn frequency(&self, key: &CacheKey) -> Option<u64> {
        self.freqs.get(key).copied()
    }

    fn detach(&mut self, key: &CacheKey, freq: u64) {
        if let Some(bucket) = self.buckets.get_mut(&freq) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(&freq);
            }
        }
    }

    fn resync_min(&mut self) {
        self.min_freq = self.buckets.keys().next().copied().unwrap_or(0);
    }
}

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn record_insert(&mut self, key: &CacheKey, _expires_at: Option<DateTime<Utc>>) {
        if let Some(freq) = self.freqs.get(key).copied() {
            self.detach(key, freq);
        }
        self.freqs.insert(key.clone(), 1);
        self.buckets.entry(1).or_default().push_back(key);
        self.min_freq = 1;
    }

    fn record_access(&mut self, key: &CacheKey) {
        let Some(freq) = self.freqs.get_mut(key) else {
            return;
        };
        let old = *freq;
        *freq = old + 1;

        let emptied = match self.buckets.get_mut(&old) {
            Some(bucket) => {
                bucket.remove(key);
                bucket.is_empty()
            }
            None => false,
        };
        if emptied {
            self.buckets.remove(&old);
            if self.min_freq == old {
                self.min_freq = old + 1;
            }
        }
        self.buckets.entry(old + 1).or_default().push_back(key);
    }

    fn evict_one(&mut self) -> Option<CacheKey> {
        let freq = if self.buckets.contains_key(&self.min_freq) {
            self.min_freq
        } else {
            *self.buckets.keys().next()?
        };

        let bucket = self.buckets.get_mut(&freq)?;
        let key = bucket.pop_front()?;
        if bucket.is_empty() {
            self.buckets.remove(&freq);
            self.resync_min();
        }
        self.freqs.remove(&key);
        Some(key)
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(freq) = self.freqs.remove(key) {
            self.detach(key, freq);
            if freq == self.min_freq && !self.buckets.contains_key(&freq) {
                self.resync_min();
            }
        }
    }

    fn len(&self) -> usize {
        self.freqs.len()
    }

    fn clear(&mut self) {
        self.freqs.clear();
        self.buckets.clear();
        self.min_freq = 0;
    }
}

// =============================================================================
// TTL
// =============================================================================

/// Expiry-ordered policy
///
/// Evicts the key closest to expiry. Keys without a deadline sort after
/// every expiring key, oldest insertion first.
#[derive(Debug, Default)]
pub struct TtlPolicy {
    queue: BTreeMap<(DateTime<Utc>, u64), CacheKey>,
    positions: HashMap<CacheKey, (DateTime<Utc>, u64)>,
    seq: u64,
}

impl TtlPolicy {
    /// Create an empty TTL policy
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for TtlPolicy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn record_insert(&mut self, key: &CacheKey, expires_at: Option<DateTime<Utc>>) {
        self.remove(key);
        self.seq += 1;
        let position = (expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC), self.seq);
        self.queue.insert(position, key.clone());
        self.positions.insert(key.clone(), position);
    }

    fn record_access(&mut self, _key: &CacheKey) {}

    fn evict_one(&mut self) -> Option<CacheKey> {
        let (_, key) = self.queue.pop_first()?;
        self.positions.remove(&key);
        Some(key)
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(position) = self.positions.remove(key) {
            self.queue.remove(&position);
        }
    }

    fn len(&self) -> usize {
        self.positions.len()
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.positions.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
