//! Value File Compression
//!
//! Optional LZ4 block compression for disk-tier value files. The algorithm
//! actually applied is recorded per index entry, so a file written without
//! compression stays readable after the tier is reconfigured.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression applied to a stored value file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as written
    #[default]
    None,
    /// LZ4 block format with size prefix
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Codec settings for the disk tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm used for new writes
    pub algorithm: CompressionAlgorithm,
    /// Payloads below this size are stored uncompressed
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            min_size_bytes: 1024,
            level: 4,
        }
    }
}

/// Encoder/decoder for value file payloads
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CompressionConfig,
}

impl Codec {
    /// Create a codec from settings
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Codec that never compresses
    pub fn plain() -> Self {
        Self::default()
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Encode a payload, returning the bytes and the algorithm actually used
    ///
    /// Small or incompressible payloads fall back to `None`.
    pub fn encode(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if self.config.algorithm == CompressionAlgorithm::None
            || (data.len() as u64) < self.config.min_size_bytes
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level)),
            true,
        ) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!("LZ4 compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Decode a payload written with `algorithm`
    pub fn decode(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
                .map(Bytes::from)
                .map_err(|e| Error::Compression {
                    algorithm: algorithm.name().into(),
                    reason: e.to_string(),
                }),
        }
    }
}
