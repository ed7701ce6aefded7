//! Error types for the tiered cache

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Value Errors
    // =========================================================================
    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Index entry and value file disagree
    #[error("Corrupt cache entry '{key}': {reason}")]
    Corruption { key: String, reason: String },

    /// Compression or decompression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    Compression { algorithm: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// I/O error on a specific path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid capacity configuration
    #[error("Invalid capacity: {0}")]
    Capacity(String),

    /// Entry can never fit into the tier
    #[error("Entry of {size} bytes exceeds tier capacity of {capacity} bytes")]
    EntryTooLarge { size: u64, capacity: u64 },

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Network validation failure
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP transport failure
    #[error("HTTP transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// Operation exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Build an I/O error bound to the path that failed
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a corruption error for a key
    pub fn corruption(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Corruption {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that affect a single key and are recovered by treating it as absent
    pub fn is_local_to_key(&self) -> bool {
        matches!(
            self,
            Error::Serialization(_) | Error::Corruption { .. } | Error::Compression { .. }
        )
    }

    /// Errors raised because the caller stopped waiting
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}
