//! Property-Based Tests for the Cache Tiers
//!
//! # Test Properties
//!
//! 1. **Bounded Size**: L1 never holds more than its capacity; L2 never
//!    occupies more bytes than its capacity
//! 2. **Round-trip**: a value just written is read back unchanged
//! 3. **LRU Order**: `n + 1` inserts into capacity `n` evict the first key
//! 4. **LFU Minimum**: the evicted key always has the tracked minimum
//!    frequency

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use super::clock::ManualClock;
use super::entry::CacheKey;
use super::l1::{MemoryConfig, MemoryTier};
use super::l2::{DiskConfig, DiskTier};
use super::policy::{EvictionPolicy, LfuPolicy, PolicyKind};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u32),
    Get(u8),
    Remove(u8),
}

/// Operations over a small key space so keys collide often
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..32, any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => (0u8..32).prop_map(Op::Get),
        1 => (0u8..32).prop_map(Op::Remove),
    ]
}

fn policy_strategy() -> impl Strategy<Value = PolicyKind> {
    prop_oneof![
        Just(PolicyKind::Lru),
        Just(PolicyKind::Lfu),
        Just(PolicyKind::Fifo),
        Just(PolicyKind::Ttl),
    ]
}

fn key(k: u8) -> CacheKey {
    CacheKey::new(format!("key-{}", k))
}

fn memory_tier(capacity: usize, policy: PolicyKind) -> MemoryTier<u32> {
    MemoryTier::new(
        &MemoryConfig {
            capacity,
            policy,
            default_ttl_secs: None,
        },
        Arc::new(ManualClock::starting_now()),
    )
    .unwrap()
}

// =============================================================================
// Memory Tier Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_memory_never_exceeds_capacity(
        capacity in 1usize..16,
        policy in policy_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let tier = memory_tier(capacity, policy);

        for op in ops {
            match op {
                Op::Put(k, v) => tier.put(key(k), v, None).unwrap(),
                Op::Get(k) => { tier.get(&key(k)); }
                Op::Remove(k) => { tier.remove(&key(k)); }
            }
            prop_assert!(tier.len() <= capacity);
        }
    }

    #[test]
    fn prop_memory_put_then_get(
        policy in policy_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..100),
        k in 0u8..32,
        v in any::<u32>(),
    ) {
        let tier = memory_tier(8, policy);
        for op in ops {
            if let Op::Put(k, v) = op {
                tier.put(key(k), v, None).unwrap();
            }
        }

        tier.put(key(k), v, None).unwrap();
        prop_assert_eq!(tier.get(&key(k)), Some(v));
    }

    #[test]
    fn prop_lru_evicts_first_inserted(capacity in 1usize..32) {
        let tier = memory_tier(capacity, PolicyKind::Lru);

        for i in 0..=capacity {
            tier.put(CacheKey::new(format!("k{}", i)), i as u32, None).unwrap();
        }

        prop_assert!(!tier.contains(&CacheKey::new("k0")));
        for i in 1..=capacity {
            let present = tier.contains(&CacheKey::new(format!("k{}", i)));
            prop_assert!(present);
        }
    }

    #[test]
    fn prop_lfu_evicts_minimum_frequency(
        ops in prop::collection::vec((0u8..16, any::<bool>()), 1..200),
    ) {
        let mut policy = LfuPolicy::new();
        let mut model: HashMap<CacheKey, u64> = HashMap::new();

        for (k, is_insert) in ops {
            let k = key(k);
            if is_insert || !model.contains_key(&k) {
                policy.record_insert(&k, None);
                model.insert(k, 1);
            } else {
                policy.record_access(&k);
                *model.entry(k).or_default() += 1;
            }
        }

        while let Some(tracked) = policy.min_frequency() {
            let actual = model.values().copied().min();
            prop_assert_eq!(Some(tracked), actual);

            let victim = policy.evict_one();
            prop_assert!(victim.is_some());
            if let Some(victim) = victim {
                prop_assert_eq!(model.remove(&victim), Some(tracked));
            }
        }
        prop_assert!(policy.is_empty());
        prop_assert!(model.is_empty());
    }
}

// =============================================================================
// Disk Tier Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_disk_never_exceeds_capacity(
        capacity in 64u64..2048,
        sizes in prop::collection::vec(2usize..256, 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let tier: DiskTier<String> = DiskTier::new(
                DiskConfig {
                    capacity_bytes: capacity,
                    ..DiskConfig::at(dir.path())
                },
                Arc::new(ManualClock::starting_now()),
            )
            .unwrap();

            for (i, size) in sizes.into_iter().enumerate() {
                // JSON string of `size` bytes
                let value = "v".repeat(size - 2);
                let result = tier.put(CacheKey::new(format!("k{}", i)), &value, None).await;
                if size as u64 <= capacity {
                    prop_assert!(result.is_ok());
                    prop_assert_eq!(
                        tier.get(&CacheKey::new(format!("k{}", i))).await.unwrap(),
                        Some(value)
                    );
                } else {
                    prop_assert!(result.is_err());
                }
                prop_assert!(tier.occupied_bytes().await.unwrap() <= capacity);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
