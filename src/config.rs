//! Cache Configuration
//!
//! `CacheConfig` is plain serde data, loadable from YAML or JSON. Absent
//! sections disable the corresponding tier.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{DiskConfig, MemoryConfig, NetworkConfig, DEFAULT_SWEEP_INTERVAL};
use crate::error::{Error, Result};

/// Configuration for a `CacheCoordinator`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 settings
    pub memory: MemoryConfig,
    /// L2 settings, `None` disables the disk tier
    pub disk: Option<DiskConfig>,
    /// L3 settings, `None` disables origin fetches
    pub network: Option<NetworkConfig>,
    /// Expiry sweep interval (seconds)
    pub sweep_interval_secs: Option<u64>,
}

impl CacheConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

        let config: CacheConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config format {:?} for {}",
                    other.unwrap_or(""),
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Check bounds that would otherwise fail at construction
    pub fn validate(&self) -> Result<()> {
        if self.memory.capacity == 0 {
            return Err(Error::Capacity(
                "memory.capacity must be at least one entry".into(),
            ));
        }

        if let Some(disk) = &self.disk {
            if disk.capacity_bytes == 0 {
                return Err(Error::Capacity(
                    "disk.capacity_bytes must be at least one byte".into(),
                ));
            }
            if !(disk.target_ratio > 0.0 && disk.target_ratio <= 1.0) {
                return Err(Error::Config(format!(
                    "disk.target_ratio must be in (0, 1], got {}",
                    disk.target_ratio
                )));
            }
            if disk.directory.as_os_str().is_empty() {
                return Err(Error::Config("disk.directory must not be empty".into()));
            }
        }

        if let Some(network) = &self.network {
            if network.request_timeout_ms == 0 {
                return Err(Error::Config(
                    "network.request_timeout_ms must be positive".into(),
                ));
            }
            if let Some(base) = &network.base_url {
                if !(base.starts_with("http://") || base.starts_with("https://")) {
                    return Err(Error::Config(format!(
                        "network.base_url must be an http(s) URL, got {}",
                        base
                    )));
                }
            }
        }

        if self.sweep_interval_secs == Some(0) {
            return Err(Error::Config("sweep_interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// Expiry sweep interval
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PolicyKind;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.disk.is_none());
        assert_eq!(config.sweep_interval(), DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.yaml");
        std::fs::write(
            &path,
            r#"
memory:
  capacity: 128
  policy: lfu
  default_ttl_secs: 30
disk:
  directory: /var/cache/app
  capacity_bytes: 1048576
network:
  base_url: https://api.example.com
  default_ttl_secs: 60
sweep_interval_secs: 5
"#,
        )
        .unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.memory.capacity, 128);
        assert_eq!(config.memory.policy, PolicyKind::Lfu);
        assert_eq!(config.memory.default_ttl(), Some(Duration::from_secs(30)));

        let disk = config.disk.unwrap();
        assert_eq!(disk.capacity_bytes, 1_048_576);
        assert_eq!(disk.target_ratio, 0.8);

        let network = config.network.unwrap();
        assert_eq!(network.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(network.request_timeout_ms, 10_000);
        assert_eq!(config.sweep_interval_secs, Some(5));
    }

    #[test]
    fn test_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"memory": {"capacity": 2, "policy": "fifo"}}"#).unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.memory.capacity, 2);
        assert_eq!(config.memory.policy, PolicyKind::Fifo);
        assert!(config.network.is_none());
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = TempDir::new().unwrap();

        let zero = dir.path().join("zero.yaml");
        std::fs::write(&zero, "memory:\n  capacity: 0\n").unwrap();
        assert!(matches!(CacheConfig::load(&zero), Err(Error::Capacity(_))));

        let ratio = dir.path().join("ratio.yaml");
        std::fs::write(&ratio, "disk:\n  directory: /tmp/c\n  target_ratio: 0\n").unwrap();
        assert!(matches!(CacheConfig::load(&ratio), Err(Error::Config(_))));

        let toml = dir.path().join("cache.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(matches!(CacheConfig::load(&toml), Err(Error::Config(_))));

        let url = dir.path().join("url.yaml");
        std::fs::write(&url, "network:\n  base_url: ftp://x\n").unwrap();
        assert!(matches!(CacheConfig::load(&url), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CacheConfig::load("/nonexistent/cache.yaml").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
