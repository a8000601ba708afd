#![forbid(unsafe_code)]
//! LFS write-back public API facade.
//!
//! Re-exports the write-back coordinator from `lfs-writeback` through a
//! stable external interface. Downstream consumers depend on this crate.

pub use lfs_writeback::*;
