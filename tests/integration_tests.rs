//! Tiered Cache Integration Tests
//!
//! End-to-end behavior across tiers:
//! - Round-trip, TTL expiry and bounded size
//! - LRU / LFU eviction order
//! - Backfill from disk and from the origin
//! - Crash recovery of the disk tier
//! - Conditional revalidation with `304 Not Modified`

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use tiered_cache::cache::{
    CacheCoordinator, CacheKey, CacheTier, DiskConfig, DiskTier, HttpResponse, JsonDecoder,
    ManualClock, MemoryConfig, MemoryTier, NetworkConfig, PolicyKind, StaticTransport,
    INDEX_FILE,
};
use tiered_cache::config::CacheConfig;
use tiered_cache::error::Error;

fn key(s: &str) -> CacheKey {
    CacheKey::new(s)
}

fn memory(capacity: usize, policy: PolicyKind) -> MemoryTier<i64> {
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

fn disk_cache(dir: &TempDir, clock: Arc<ManualClock>) -> CacheCoordinator<String> {
    CacheCoordinator::builder()
        .memory(MemoryConfig {
            capacity: 64,
            ..Default::default()
        })
        .disk(DiskConfig::at(dir.path()))
        .clock(clock)
        .build()
        .unwrap()
}

// =============================================================================
// Core Properties
// =============================================================================

mod properties {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, Arc::new(ManualClock::starting_now()));

        for i in 0..20 {
            assert_ok!(
                cache
                    .put(key(&format!("k{}", i)), format!("value-{}", i), None)
                    .await
            );
        }
        for i in 0..20 {
            assert_eq!(
                cache.get(&key(&format!("k{}", i))).await,
                Some(format!("value-{}", i))
            );
        }
        assert_eq!(cache.size().await, 20);
    }

    #[tokio::test]
    async fn test_ttl_expiry_removes_from_every_tier() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = disk_cache(&dir, clock.clone());

        cache
            .put(key("session"), "token".into(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let path = cache
            .disk()
            .unwrap()
            .value_path(&key("session"))
            .await
            .unwrap()
            .unwrap();
        assert!(path.exists());

        clock.advance(Duration::from_secs(4));
        assert_eq!(cache.get(&key("session")).await.as_deref(), Some("token"));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&key("session")).await, None);
        assert!(!path.exists());
        assert!(!cache.memory().contains(&key("session")));
    }

    #[tokio::test]
    async fn test_bounded_size() {
        let tier = memory(3, PolicyKind::Lru);
        for i in 0..10 {
            tier.put(key(&format!("k{}", i)), i, None).unwrap();
            assert!(tier.len() <= 3);
        }
        assert_eq!(tier.evictions(), 7);

        let dir = TempDir::new().unwrap();
        let disk: DiskTier<String> = DiskTier::new(
            DiskConfig {
                capacity_bytes: 500,
                ..DiskConfig::at(dir.path())
            },
            Arc::new(ManualClock::starting_now()),
        )
        .unwrap();
        for i in 0..20 {
            disk.put(key(&format!("k{}", i)), &"x".repeat(48), None)
                .await
                .unwrap();
            assert!(disk.occupied_bytes().await.unwrap() <= 500);
        }
    }

    #[test]
    fn test_lru_evicts_first_inserted() {
        let tier = memory(4, PolicyKind::Lru);
        for i in 0..5 {
            tier.put(key(&format!("k{}", i)), i, None).unwrap();
        }

        assert_eq!(tier.get(&key("k0")), None);
        for i in 1..5 {
            assert_eq!(tier.get(&key(&format!("k{}", i))), Some(i));
        }
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        let tier = memory(3, PolicyKind::Lfu);
        tier.put(key("a"), 1, None).unwrap();
        tier.put(key("b"), 2, None).unwrap();
        tier.put(key("c"), 3, None).unwrap();

        tier.get(&key("a"));
        tier.get(&key("a"));
        tier.get(&key("b"));

        tier.put(key("d"), 4, None).unwrap();
        assert!(!tier.contains(&key("c")));
        assert!(tier.contains(&key("a")));
        assert!(tier.contains(&key("b")));
        assert!(tier.contains(&key("d")));
    }

    #[test]
    fn test_fifo_ignores_access() {
        let tier = memory(2, PolicyKind::Fifo);
        tier.put(key("a"), 1, None).unwrap();
        tier.put(key("b"), 2, None).unwrap();
        tier.get(&key("a"));

        tier.put(key("c"), 3, None).unwrap();
        assert!(!tier.contains(&key("a")));
        assert!(tier.contains(&key("b")));
    }

    #[tokio::test]
    async fn test_disk_hit_backfills_memory() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, Arc::new(ManualClock::starting_now()));

        cache.put(key("a"), "1".into(), None).await.unwrap();
        cache.memory().clear();

        let first = cache.lookup(&key("a")).await.unwrap();
        assert_eq!(first.tier, CacheTier::L2);

        let second = cache.lookup(&key("a")).await.unwrap();
        assert_eq!(second.tier, CacheTier::L1);
        assert_eq!(second.value, "1");
    }

    #[tokio::test]
    async fn test_concurrent_writers_and_readers() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(disk_cache(&dir, Arc::new(ManualClock::starting_now())));

        let writes = (0..16).map(|i| {
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .put(key(&format!("k{}", i)), format!("v{}", i), None)
                    .await
            }
        });
        for result in futures::future::join_all(writes).await {
            assert_ok!(result);
        }

        let reads = (0..16).map(|i| {
            let cache = Arc::clone(&cache);
            async move { cache.get(&key(&format!("k{}", i))).await }
        });
        let values = futures::future::join_all(reads).await;
        for (i, value) in values.into_iter().enumerate() {
            assert_eq!(value, Some(format!("v{}", i)));
        }
    }
}

// =============================================================================
// Disk Recovery
// =============================================================================

mod recovery {
    use super::*;

    fn open(dir: &TempDir) -> DiskTier<String> {
        DiskTier::new(DiskConfig::at(dir.path()), Arc::new(ManualClock::starting_now())).unwrap()
    }

    #[tokio::test]
    async fn test_value_written_but_index_not_updated() {
        let dir = TempDir::new().unwrap();
        {
            let tier = open(&dir);
            tier.put(key("committed"), &"ok".to_string(), None)
                .await
                .unwrap();
            tier.dispose().await.unwrap();
        }

        // Crash after the rename but before the index write
        let uncommitted = dir
            .path()
            .join(format!("{}.5678.bin", key("uncommitted").digest()));
        std::fs::write(&uncommitted, b"\"half-done\"").unwrap();
        // Crash before the rename
        let partial = dir.path().join(format!("{}.1234.tmp", key("other").digest()));
        std::fs::write(&partial, b"\"par").unwrap();

        let tier = open(&dir);
        assert_eq!(tier.get(&key("uncommitted")).await.unwrap(), None);
        assert_eq!(tier.get(&key("committed")).await.unwrap().as_deref(), Some("ok"));
        assert!(!uncommitted.exists());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn test_overwrite_interrupted_before_index_write() {
        let dir = TempDir::new().unwrap();
        let committed = {
            let tier = open(&dir);
            tier.put(key("k"), &"old1".to_string(), Some(Duration::from_secs(3600)))
                .await
                .unwrap();
            let path = tier.value_path(&key("k")).await.unwrap().unwrap();
            tier.dispose().await.unwrap();
            path
        };

        // The replacement reached its final name but the index still names the old file
        let replacement = dir.path().join(format!("{}.9abc.bin", key("k").digest()));
        std::fs::write(&replacement, b"\"new2\"").unwrap();

        let tier = open(&dir);
        let hit = tier.get_entry(&key("k")).await.unwrap().unwrap();
        assert_eq!(hit.value, "old1");
        assert!(hit.remaining_ttl.is_some());
        assert!(committed.exists());
        assert!(!replacement.exists());
    }

    #[tokio::test]
    async fn test_value_file_replaced_in_place_is_not_served() {
        let dir = TempDir::new().unwrap();
        let committed = {
            let tier = open(&dir);
            tier.put(key("k"), &"old1".to_string(), Some(Duration::from_secs(3600)))
                .await
                .unwrap();
            let path = tier.value_path(&key("k")).await.unwrap().unwrap();
            tier.dispose().await.unwrap();
            path
        };

        // Same size, different bytes
        std::fs::write(&committed, b"\"new2\"").unwrap();

        let tier = open(&dir);
        assert_eq!(tier.get(&key("k")).await.unwrap(), None);
        assert_eq!(tier.corruptions(), 1);
        assert!(!committed.exists());
    }

    #[tokio::test]
    async fn test_corrupt_entry_only_affects_its_key() {
        let dir = TempDir::new().unwrap();
        let tier = open(&dir);
        tier.put(key("a"), &"alpha".to_string(), None).await.unwrap();
        tier.put(key("b"), &"bravo".to_string(), None).await.unwrap();

        let path = tier.value_path(&key("a")).await.unwrap().unwrap();
        std::fs::write(path, b"\x00\x01\x02\x03\x04\x05\x06").unwrap();

        assert_eq!(tier.get(&key("a")).await.unwrap(), None);
        assert_eq!(tier.get(&key("b")).await.unwrap().as_deref(), Some("bravo"));
        assert_eq!(tier.corruptions(), 1);
        assert_eq!(tier.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_index_entry_without_file_is_dropped_on_load() {
        let dir = TempDir::new().unwrap();
        let path = {
            let tier = open(&dir);
            tier.put(key("gone"), &"x".to_string(), None).await.unwrap();
            let path = tier.value_path(&key("gone")).await.unwrap().unwrap();
            tier.dispose().await.unwrap();
            path
        };
        std::fs::remove_file(path).unwrap();

        let tier = open(&dir);
        tier.init().await.unwrap();
        assert!(tier.is_empty().await.unwrap());

        let index = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(!index.contains("\"gone\""));
    }

    #[tokio::test]
    async fn test_oversized_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tier: DiskTier<String> = DiskTier::new(
            DiskConfig {
                capacity_bytes: 16,
                ..DiskConfig::at(dir.path())
            },
            Arc::new(ManualClock::starting_now()),
        )
        .unwrap();

        let err = assert_err!(tier.put(key("big"), &"y".repeat(64), None).await);
        assert_matches!(err, Error::EntryTooLarge { size: 66, capacity: 16 });
    }
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;
    use reqwest::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
    use reqwest::StatusCode;

    #[test]
    fn test_capacity_two_lru() {
        let tier = memory(2, PolicyKind::Lru);

        tier.put(key("a"), 1, None).unwrap();
        tier.put(key("b"), 2, None).unwrap();
        assert_eq!(tier.get(&key("a")), Some(1));
        tier.put(key("c"), 3, None).unwrap();

        assert_eq!(tier.get(&key("b")), None);
        assert_eq!(tier.get(&key("a")), Some(1));
        assert_eq!(tier.get(&key("c")), Some(3));
    }

    #[tokio::test]
    async fn test_max_age_zero_revalidates_with_etag() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let transport = Arc::new(StaticTransport::new());
        let url = "http://origin.test/report";

        transport.enqueue(
            url,
            HttpResponse::new(StatusCode::OK)
                .with_header(CACHE_CONTROL, "max-age=0")
                .with_header(ETAG, "\"v1\"")
                .with_body("\"payload\""),
        );
        transport.enqueue(
            url,
            HttpResponse::new(StatusCode::NOT_MODIFIED)
                .with_header(CACHE_CONTROL, "max-age=60")
                .with_header(ETAG, "\"v1\""),
        );

        let cache: CacheCoordinator<String> = CacheCoordinator::builder()
            .disk(DiskConfig::at(dir.path()))
            .network(
                NetworkConfig {
                    base_url: Some("http://origin.test".into()),
                    ..Default::default()
                },
                transport.clone(),
                Arc::new(JsonDecoder),
            )
            .clock(clock.clone())
            .build()
            .unwrap();

        let first = cache.lookup(&key("report")).await.unwrap();
        assert_eq!(first.tier, CacheTier::L3);
        assert_eq!(first.value, "payload");
        assert!(!cache.memory().contains(&key("report")));

        let path = cache
            .disk()
            .unwrap()
            .value_path(&key("report"))
            .await
            .unwrap()
            .unwrap();
        let stored = std::fs::read(&path).unwrap();

        let second = cache.lookup(&key("report")).await.unwrap();
        assert_eq!(second.tier, CacheTier::L2);
        assert_eq!(second.value, "payload");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].headers.get(IF_NONE_MATCH).is_none());
        assert_eq!(
            requests[1].headers.get(IF_NONE_MATCH).unwrap().to_str().unwrap(),
            "\"v1\""
        );

        assert_eq!(std::fs::read(&path).unwrap(), stored);
        let hit = cache.disk().unwrap().get_entry(&key("report")).await.unwrap().unwrap();
        assert_eq!(hit.validation.unwrap().freshness(), Duration::from_secs(60));

        // Fresh again: served locally without another request
        let third = cache.lookup(&key("report")).await.unwrap();
        assert_eq!(third.tier, CacheTier::L1);
        assert_eq!(transport.request_count(), 2);

        let snapshot = cache.metrics().await;
        assert_eq!(snapshot.l3_not_modified, 1);
        assert_eq!(snapshot.backfills_l2, 1);
    }

    #[tokio::test]
    async fn test_cli_style_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.yaml");
        std::fs::write(
            &path,
            format!(
                "memory:\n  capacity: 8\n  policy: lfu\ndisk:\n  directory: {}\n  capacity_bytes: 4096\n",
                dir.path().join("store").display()
            ),
        )
        .unwrap();

        let config = CacheConfig::load(&path).unwrap();
        let cache: CacheCoordinator<serde_json::Value> =
            CacheCoordinator::from_config(&config).unwrap();
        cache.init().await.unwrap();

        let value = serde_json::json!({"name": "widget", "tags": ["a", "b"]});
        cache.put(key("item"), value.clone(), None).await.unwrap();
        cache.dispose().await.unwrap();

        let reopened: CacheCoordinator<serde_json::Value> =
            CacheCoordinator::from_config(&config).unwrap();
        assert_eq!(reopened.get(&key("item")).await, Some(value));
        assert_eq!(reopened.memory().policy_name(), "lfu");
    }
}
