//! Tiered Cache CLI
//!
//! Operates on a disk-backed cache of JSON values. When a `base_url` is
//! configured, misses are fetched from that origin and revalidated.
//!
//! ```text
//! tiered-cache --dir /var/cache/app put user:1 '{"name":"alice"}' --ttl-secs 60
//! tiered-cache --dir /var/cache/app get user:1
//! tiered-cache --dir /var/cache/app stats --prometheus
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiered_cache::cache::{CacheCoordinator, CacheKey, DiskConfig, NetworkConfig, PolicyKind};
use tiered_cache::config::CacheConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered Cache - memory, disk and HTTP-validated caching
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (.yaml, .yml or .json)
    #[arg(long, env = "TIERED_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Disk tier directory
    #[arg(long, env = "TIERED_CACHE_DIR")]
    dir: Option<PathBuf>,

    /// Disk tier capacity in bytes
    #[arg(long, env = "TIERED_CACHE_CAPACITY_BYTES")]
    capacity_bytes: Option<u64>,

    /// Memory tier capacity in entries
    #[arg(long, env = "TIERED_CACHE_MEMORY_CAPACITY")]
    memory_capacity: Option<usize>,

    /// Memory tier eviction policy (lru, lfu, fifo, ttl)
    #[arg(long, env = "TIERED_CACHE_POLICY")]
    policy: Option<PolicyKind>,

    /// Origin that keys are fetched from on a miss
    #[arg(long, env = "TIERED_CACHE_BASE_URL")]
    base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a cached value; exits with status 1 on a miss
    Get { key: String },
    /// Store a value (JSON, or a plain string if it does not parse)
    Put {
        key: String,
        value: String,
        /// Time to live in seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Remove a key from every tier
    Remove { key: String },
    /// Remove every entry
    Clear,
    /// Print cache statistics
    Stats {
        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },
    /// Drop expired entries
    Purge,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = build_config(&args)?;
    let cache: CacheCoordinator<Value> =
        CacheCoordinator::from_config(&config).context("failed to build cache")?;
    cache.init().await.context("failed to open disk tier")?;

    info!(
        directory = ?config.disk.as_ref().map(|d| d.directory.display().to_string()),
        network = config.network.is_some(),
        "Cache opened"
    );

    let mut code = ExitCode::SUCCESS;
    match args.command {
        Command::Get { key } => match cache.lookup(&CacheKey::new(key)).await {
            Some(result) => {
                info!(tier = %result.tier, latency = ?result.latency, "Cache hit");
                println!("{}", serde_json::to_string_pretty(&result.value)?);
            }
            None => code = ExitCode::from(1),
        },
        Command::Put {
            key,
            value,
            ttl_secs,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            cache
                .put(CacheKey::new(key), value, ttl_secs.map(Duration::from_secs))
                .await?;
        }
        Command::Remove { key } => {
            let removed = cache.remove(&CacheKey::new(key)).await?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
        Command::Clear => cache.clear().await?,
        Command::Stats { prometheus } => {
            let snapshot = cache.metrics().await;
            if prometheus {
                print!("{}", snapshot.to_prometheus()?);
            } else {
                let summary = serde_json::json!({
                    "entries": cache.size().await,
                    "metrics": snapshot,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Command::Purge => {
            let purged = cache.purge_expired().await?;
            println!("purged {} entries", purged);
        }
    }

    cache.dispose().await.context("failed to flush disk tier")?;
    Ok(code)
}

/// File configuration with command-line overrides applied
fn build_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::default(),
    };

    let disk = config.disk.get_or_insert_with(DiskConfig::default);
    if let Some(dir) = &args.dir {
        disk.directory = dir.clone();
    }
    if let Some(capacity) = args.capacity_bytes {
        disk.capacity_bytes = capacity;
    }

    if let Some(capacity) = args.memory_capacity {
        config.memory.capacity = capacity;
    }
    if let Some(policy) = args.policy {
        config.memory.policy = policy;
    }
    if let Some(base_url) = &args.base_url {
        config
            .network
            .get_or_insert_with(NetworkConfig::default)
            .base_url = Some(base_url.clone());
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so stdout stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
