#![forbid(unsafe_code)]
//! Segment construction for the LFS write-back core.
//!
//! - [`SegmentLock`] serializes segment construction and the log append
//!   position across the filesystem; its [`SegmentGuard`] is the held-lock
//!   capability.
//! - [`Segment`] is the active partial segment. It implements
//!   [`PageWriter`](lfs_cache::PageWriter) so the cache reclaimer can gather
//!   dirty blocks straight into it.
//! - [`InodeTable`] keeps each file's block map and the indirect blocks that
//!   went stale when a child moved.
//! - [`LogDevice`] is the append target, with in-memory and file backends.

mod device;
mod inode;
mod lock;
mod segment;

pub use device::{FileLogDevice, LogDevice, MemLogDevice, PartialRecord};
pub use inode::{InodeMeta, InodeTable};
pub use lock::{LockMode, SegmentGuard, SegmentLock};
pub use segment::{BlockKind, FileInfo, SS_CONT, SS_DIROP, Segment, SegmentStats};
