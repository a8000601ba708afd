#![forbid(unsafe_code)]
//! Page cache layer for the LFS write-back core.
//!
//! Provides per-file page caches ([`FileCache`]) with explicit busy/dirty/
//! wired page state, the busy-page waiter, fault-in of whole blocks, and the
//! generic range reclaimer ([`FileCache::put_range`]) that the write-back
//! coordinator delegates clean ranges to and drives segment gathers through.
//!
//! Pages are owned by their file cache and keyed by byte offset; callers
//! address them by [`PageId`](lfs_types::PageId) and only ever hold them
//! through the file lock.

mod file;
mod page;
mod reclaim;

pub use file::{FileCache, FileState};
pub use page::Page;
pub use reclaim::{BlockWrite, PageWriter, PutFlags, PutResult, RefuseWrites, WriteVerdict};

use lfs_error::{LfsError, Result};
use lfs_types::{FileId, Geometry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of every file's page cache.
#[derive(Debug)]
pub struct PageCache {
    geometry: Geometry,
    files: RwLock<HashMap<FileId, Arc<FileCache>>>,
}

impl PageCache {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            files: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Return the cache for `id`, creating an empty one if needed.
    pub fn insert_file(&self, id: FileId) -> Arc<FileCache> {
        if let Some(file) = self.files.read().get(&id) {
            return Arc::clone(file);
        }
        let mut files = self.files.write();
        Arc::clone(
            files
                .entry(id)
                .or_insert_with(|| Arc::new(FileCache::new(id, self.geometry))),
        )
    }

    pub fn file(&self, id: FileId) -> Result<Arc<FileCache>> {
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| LfsError::NotFound(id.to_string()))
    }

    pub fn remove_file(&self, id: FileId) -> Option<Arc<FileCache>> {
        self.files.write().remove(&id)
    }

    /// Snapshot of registered file ids in ascending order.
    #[must_use]
    pub fn file_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self.files.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
