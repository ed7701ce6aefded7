//! Tiered Cache - Memory, Disk and HTTP-Validated Caching
//!
//! A generic multi-tier cache: a bounded in-process memory tier with
//! pluggable eviction, a crash-safe disk tier with a JSON metadata index,
//! and an HTTP validation tier that fetches from an origin and revalidates
//! with `ETag` / `Last-Modified`.
//!
//! # Architecture
//!
//! ```text
//! get ─► L1 MemoryTier ─► L2 DiskTier ─► L3 NetworkValidationTier ─► origin
//!             ▲                ▲                     │
//!             └────────────────┴──── backfill ◄──────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, eviction policies and the coordinator
//! - [`config`] - Serde configuration loaded from YAML or JSON
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiered_cache::cache::{CacheCoordinator, CacheKey, DiskConfig};
//!
//! # async fn demo() -> tiered_cache::error::Result<()> {
//! let cache: CacheCoordinator<String> = CacheCoordinator::builder()
//!     .disk(DiskConfig::at("/var/cache/demo"))
//!     .build()?;
//! cache.init().await?;
//!
//! cache.put(CacheKey::new("greeting"), "hello".into(), Some(Duration::from_secs(60))).await?;
//! assert_eq!(cache.get(&CacheKey::new("greeting")).await.as_deref(), Some("hello"));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{CacheCoordinator, CacheKey, CacheTier};
pub use config::CacheConfig;
pub use error::{Error, Result};
