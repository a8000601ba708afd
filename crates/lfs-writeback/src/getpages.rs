//! Read-path guard.

use crate::Lfs;
use lfs_error::{LfsError, Result};
use lfs_types::FileId;
use tracing::trace;

/// Access requested by a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Lfs {
    /// Fault in the page holding `offset`, reading its whole block.
    ///
    /// Writable faults on the metadata inode are refused: its blocks change
    /// only through checkpoints. A writable fault on any other file marks
    /// its inode modified.
    pub fn getpages(&self, file: FileId, offset: u64, access: Access) -> Result<Vec<u8>> {
        let write = access == Access::Write;
        if write && file.is_ifile() {
            return Err(LfsError::NotPermitted);
        }
        let fc = self.cache.file(file)?;
        if write {
            self.inodes.mark_modified(file);
        }
        trace!(
            target: "lfs::cache",
            event = "getpages",
            file = file.0,
            offset,
            write
        );
        Ok(fc.fault(offset, write))
    }
}
