#![forbid(unsafe_code)]
//! Shared vocabulary for the LFS write-back core.
//!
//! Unit-carrying newtypes keep file identities, byte offsets, logical block
//! numbers, and log addresses from being mixed up. [`Geometry`] owns every
//! page/block rounding rule so callers never hand-roll mask arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Inode number of the reserved metadata inode (the "ifile").
pub const IFILE_INUM: u64 = 1;

/// Number of direct block pointers held in an inode.
pub const NDADDR: u64 = 12;

/// Number of indirect trees hanging off an inode (single, double, triple).
pub const NIADDR: u8 = 3;

/// Default cost multiplier used when choosing between an ordered page-list
/// walk and an offset-probing walk.
pub const PAGE_TREE_PENALTY: u64 = 4;

/// Largest byte offset a file may address.
pub const MAX_FILE_OFFSET: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    pub const IFILE: Self = Self(IFILE_INUM);

    #[must_use]
    pub fn is_ifile(self) -> bool {
        self.0 == IFILE_INUM
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino {}", self.0)
    }
}

/// Logical block number within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

/// Block address on the log device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskAddr(pub u64);

impl DiskAddr {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Stable identity of a cached page: owning file plus page-aligned byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub file: FileId,
    pub offset: u64,
}

impl PageId {
    #[must_use]
    pub fn new(file: FileId, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.file, self.offset)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated page and block sizes.
///
/// Invariants: both sizes are powers of two in `512..=65536`, and a block
/// is never smaller than a page, so every block spans whole pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    page_size: u32,
    block_size: u32,
}

impl Geometry {
    pub fn new(page_size: u32, block_size: u32) -> Result<Self, GeometryError> {
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(GeometryError::InvalidField {
                field: "page_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        if !block_size.is_power_of_two() || !(512..=65536).contains(&block_size) {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        if block_size < page_size {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must not be smaller than page_size",
            });
        }
        Ok(Self {
            page_size,
            block_size,
        })
    }

    #[must_use]
    pub fn page_size(self) -> u64 {
        u64::from(self.page_size)
    }

    #[must_use]
    pub fn block_size(self) -> u64 {
        u64::from(self.block_size)
    }

    #[must_use]
    pub fn page_shift(self) -> u32 {
        self.page_size.trailing_zeros()
    }

    #[must_use]
    pub fn block_shift(self) -> u32 {
        self.block_size.trailing_zeros()
    }

    /// Pages covering one block.
    #[must_use]
    pub fn pages_per_block(self) -> u64 {
        self.block_size() >> self.page_shift()
    }

    /// Distance between consecutive block-start pages.
    #[must_use]
    pub fn block_stride(self) -> u64 {
        self.block_size()
    }

    /// Block-pointer slots in one indirect block (8-byte addresses).
    #[must_use]
    pub fn pointers_per_block(self) -> u64 {
        self.block_size() / 8
    }

    #[must_use]
    pub fn block_round_down(self, offset: u64) -> u64 {
        offset & !(self.block_size() - 1)
    }

    /// Round up to a block boundary, saturating at the largest aligned offset.
    #[must_use]
    pub fn block_round_up(self, offset: u64) -> u64 {
        let mask = self.block_size() - 1;
        offset
            .checked_add(mask)
            .map_or(self.block_round_down(u64::MAX), |v| v & !mask)
    }

    #[must_use]
    pub fn page_round_down(self, offset: u64) -> u64 {
        offset & !(self.page_size() - 1)
    }

    #[must_use]
    pub fn page_round_up(self, offset: u64) -> u64 {
        let mask = self.page_size() - 1;
        offset
            .checked_add(mask)
            .map_or(self.page_round_down(u64::MAX), |v| v & !mask)
    }

    #[must_use]
    pub fn is_block_aligned(self, offset: u64) -> bool {
        offset & (self.block_size() - 1) == 0
    }

    #[must_use]
    pub fn lblkno(self, offset: u64) -> LogicalBlock {
        LogicalBlock(offset >> self.block_shift())
    }

    #[must_use]
    pub fn block_offset(self, lbn: LogicalBlock) -> Option<u64> {
        lbn.0.checked_mul(self.block_size())
    }

    /// Largest block-aligned, page-aligned offset a range may extend to.
    #[must_use]
    pub fn max_end_offset(self) -> u64 {
        let page_trunc = self.page_round_down(MAX_FILE_OFFSET);
        (page_trunc >> self.block_shift()) << self.block_shift()
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            page_size: 4096,
            block_size: 8192,
        }
    }
}

/// Position of one indirect block in an inode's pointer trees.
///
/// `tree` selects the inode's single (1), double (2), or triple (3) indirect
/// pointer; `level` counts up from the blocks that point directly at data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndirectKey {
    pub tree: u8,
    pub level: u8,
    pub index: u64,
}

/// Indirect blocks that must be rewritten when `lbn` moves, innermost first.
///
/// Direct blocks (`lbn < NDADDR`) have no chain. Blocks past the triple
/// indirect tree's reach also return an empty chain.
#[must_use]
pub fn indirect_chain(lbn: LogicalBlock, pointers_per_block: u64) -> Vec<IndirectKey> {
    let Some(mut rel) = lbn.0.checked_sub(NDADDR) else {
        return Vec::new();
    };
    let nindir = pointers_per_block.max(1);
    let mut span = 1_u64;
    for tree in 1..=NIADDR {
        span = span.saturating_mul(nindir);
        if rel < span {
            let mut chain = Vec::with_capacity(usize::from(tree));
            let mut per = 1_u64;
            for level in 1..=tree {
                per = per.saturating_mul(nindir);
                chain.push(IndirectKey {
                    tree,
                    level,
                    index: rel / per,
                });
            }
            return chain;
        }
        rel -= span;
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_non_power_of_two() {
        assert!(Geometry::new(4096, 3000).is_err());
        assert!(Geometry::new(1000, 8192).is_err());
        assert!(Geometry::new(4096, 128 * 1024).is_err());
        assert!(Geometry::new(4096, 8192).is_ok());
    }

    #[test]
    fn rounding_helpers_follow_block_size() {
        let geo = Geometry::new(4096, 8192).unwrap();
        assert_eq!(geo.pages_per_block(), 2);
        assert_eq!(geo.block_round_down(12_000), 8192);
        assert_eq!(geo.block_round_up(12_000), 16_384);
        assert_eq!(geo.block_round_up(16_384), 16_384);
        assert_eq!(geo.page_round_up(1), 4096);
        assert_eq!(geo.lblkno(16_384), LogicalBlock(2));
        assert_eq!(geo.block_round_up(u64::MAX), geo.block_round_down(u64::MAX));
    }

    #[test]
    fn geometry_rejects_block_smaller_than_page() {
        let err = Geometry::new(4096, 1024).unwrap_err();
        assert_eq!(
            err,
            GeometryError::InvalidField {
                field: "block_size",
                reason: "must not be smaller than page_size",
            }
        );
        let geo = Geometry::new(4096, 4096).unwrap();
        assert_eq!(geo.pages_per_block(), 1);
        assert_eq!(geo.block_stride(), 4096);
    }

    #[test]
    fn max_end_offset_is_block_and_page_aligned() {
        let geo = Geometry::default();
        let max = geo.max_end_offset();
        assert!(geo.is_block_aligned(max));
        assert_eq!(max % geo.page_size(), 0);
        assert!(max <= MAX_FILE_OFFSET);
    }

    #[test]
    fn indirect_chain_by_tree() {
        let nindir = 4;
        assert!(indirect_chain(LogicalBlock(3), nindir).is_empty());

        let single = indirect_chain(LogicalBlock(NDADDR + 2), nindir);
        assert_eq!(
            single,
            vec![IndirectKey {
                tree: 1,
                level: 1,
                index: 0
            }]
        );

        // First block of the double-indirect tree.
        let double = indirect_chain(LogicalBlock(NDADDR + nindir + 5), nindir);
        assert_eq!(double.len(), 2);
        assert_eq!(double[0].tree, 2);
        assert_eq!(double[0].index, 1);
        assert_eq!(double[1].level, 2);
        assert_eq!(double[1].index, 0);

        let beyond = NDADDR + nindir + nindir * nindir + nindir * nindir * nindir;
        assert!(indirect_chain(LogicalBlock(beyond), nindir).is_empty());
        assert_eq!(indirect_chain(LogicalBlock(beyond - 1), nindir).len(), 3);
    }
}
