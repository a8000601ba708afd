//! Instance configuration.

use lfs_error::{LfsError, Result};
use lfs_types::{Geometry, PAGE_TREE_PENALTY};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for an [`Lfs`](crate::Lfs) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritebackConfig {
    /// Page size in bytes. Default: 4096.
    pub page_size: u32,
    /// Filesystem block size in bytes. Must not be smaller than a page.
    /// Default: 8192.
    pub block_size: u32,
    /// Blocks one partial segment can hold, at least 2. Default: 64.
    pub segment_blocks: usize,
    /// Cost multiplier for choosing the ordered page-list walk in the
    /// classifier. Default: 4.
    pub page_tree_penalty: u64,
    /// Pause before retrying a busy gather under forced reclaim.
    /// Default: 1ms.
    pub reclaim_backoff: Duration,
    /// Periodic wake-up of the writer daemon. Default: 100ms.
    pub writer_interval: Duration,
    /// Retry count past which loops start logging warnings. Default: 4.
    pub too_many_retries: u32,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            block_size: 8192,
            segment_blocks: 64,
            page_tree_penalty: PAGE_TREE_PENALTY,
            reclaim_backoff: Duration::from_millis(1),
            writer_interval: Duration::from_millis(100),
            too_many_retries: 4,
        }
    }
}

impl WritebackConfig {
    /// Validate the sizes into a [`Geometry`].
    pub fn geometry(&self) -> Result<Geometry> {
        let geometry = Geometry::new(self.page_size, self.block_size)
            .map_err(|err| LfsError::InvalidGeometry(err.to_string()))?;
        // One slot of a single-file segment is kept for the inode record.
        if self.segment_blocks < 2 {
            return Err(LfsError::InvalidGeometry(format!(
                "segment_blocks {} leaves no room for data",
                self.segment_blocks
            )));
        }
        Ok(geometry)
    }
}
