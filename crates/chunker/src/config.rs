use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for span production
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Span producer to use
    pub strategy: ChunkingStrategy,

    /// Target span size in bytes (a span may exceed it by at most one
    /// multi-byte character)
    pub size: usize,

    /// Maximum overlap between adjacent spans in bytes
    pub overlap: usize,

    /// Prefer cutting fixed windows after a newline
    pub align_to_lines: bool,

    /// Hard cap on the number of spans for one context
    pub max_chunks: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Fixed,
            size: 50_000,
            overlap: 2_000,
            align_to_lines: true,
            max_chunks: 10_000,
        }
    }
}

impl ChunkerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err("size must be > 0".to_string());
        }

        if self.overlap >= self.size {
            return Err(format!(
                "overlap ({}) must be smaller than size ({})",
                self.overlap, self.size
            ));
        }

        if self.max_chunks == 0 {
            return Err("max_chunks must be > 0".to_string());
        }

        Ok(())
    }
}

/// Strategy for placing span boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Fixed-size windows
    Fixed,

    /// Windows whose ends snap to file sections and top-level syntax items
    Structure,
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Fixed
    }
}

const CHUNK_TIMEOUT_BASE: Duration = Duration::from_secs(5);
const CHUNK_TIMEOUT_PER_MIB: Duration = Duration::from_secs(2);
const CHUNK_TIMEOUT_CAP: Duration = Duration::from_secs(120);

/// Deadline budget for chunking a context of `len` bytes: grows with input
/// size and is capped.
pub fn chunk_timeout_for(len: usize) -> Duration {
    let mib = u32::try_from(len / (1024 * 1024)).unwrap_or(u32::MAX);
    CHUNK_TIMEOUT_BASE
        .saturating_add(CHUNK_TIMEOUT_PER_MIB.saturating_mul(mib))
        .min(CHUNK_TIMEOUT_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ChunkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ChunkerConfig {
            size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.size = 100;
        config.overlap = 100;
        assert!(config.validate().is_err());

        config.overlap = 99;
        assert!(config.validate().is_ok());

        config.max_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn chunk_timeout_scales_and_caps() {
        assert_eq!(chunk_timeout_for(0), Duration::from_secs(5));
        assert_eq!(chunk_timeout_for(3 * 1024 * 1024), Duration::from_secs(11));
        assert_eq!(chunk_timeout_for(usize::MAX), CHUNK_TIMEOUT_CAP);
    }
}
