//! Pool geometry and limits.

use pmfs_error::{PmfsError, Result};
use pmfs_types::{BlockSize, PERMISSION_MASK};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings fixed at pool creation.
///
/// Missing JSON fields fall back to [`PoolConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of named roots. Immutable for the pool's lifetime.
    pub root_count: usize,
    /// Granularity used when a write fills a hole.
    pub block_size: BlockSize,
    /// An adjacent extent is grown only while it stays within this size.
    pub max_extent_size: u64,
    /// Bytes the pool may hand out before allocations fail.
    pub capacity: u64,
    pub max_symlink_expansions: usize,
    pub root_mode: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            root_count: 4,
            block_size: BlockSize::default(),
            max_extent_size: 1 << 20,
            capacity: 256 << 20,
            max_symlink_expansions: 40,
            root_mode: 0o777,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.root_count == 0 {
            return Err(PmfsError::InvalidArgument(
                "root_count must be at least 1".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(PmfsError::InvalidArgument("capacity must be non-zero".into()));
        }
        if self.max_extent_size < self.block_size.get() {
            return Err(PmfsError::InvalidArgument(format!(
                "max_extent_size {} is smaller than block_size {}",
                self.max_extent_size,
                self.block_size.get()
            )));
        }
        if self.root_mode & !PERMISSION_MASK != 0 {
            return Err(PmfsError::InvalidArgument(format!(
                "root_mode {:#o} has bits outside {PERMISSION_MASK:#o}",
                self.root_mode
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| PmfsError::InvalidArgument(format!("pool config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            PmfsError::InvalidArgument(format!("pool config {}: {err}", path.display()))
        })?;
        Self::from_json(&text)
    }
}
