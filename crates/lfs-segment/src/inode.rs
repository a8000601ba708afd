//! In-core inode block maps.
//!
//! Records where each logical block of a file last landed in the log and
//! which indirect blocks went stale because one of their children moved.

use lfs_types::{DiskAddr, FileId, Geometry, IndirectKey, LogicalBlock, indirect_chain};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeMeta {
    pub version: u32,
    pub blocks: BTreeMap<LogicalBlock, DiskAddr>,
    pub indirect: BTreeMap<IndirectKey, DiskAddr>,
    pub dirty_indirect: BTreeSet<IndirectKey>,
    pub inode_addr: Option<DiskAddr>,
    /// Inode needs writing (set by write faults and block moves).
    pub modified: bool,
}

#[derive(Debug)]
pub struct InodeTable {
    geometry: Geometry,
    inner: Mutex<HashMap<FileId, InodeMeta>>,
}

impl InodeTable {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, file: FileId) {
        self.inner.lock().entry(file).or_default();
    }

    pub fn remove(&self, file: FileId) -> Option<InodeMeta> {
        self.inner.lock().remove(&file)
    }

    #[must_use]
    pub fn get(&self, file: FileId) -> Option<InodeMeta> {
        self.inner.lock().get(&file).cloned()
    }

    #[must_use]
    pub fn version(&self, file: FileId) -> u32 {
        self.inner.lock().get(&file).map_or(0, |meta| meta.version)
    }

    #[must_use]
    pub fn block_addr(&self, file: FileId, lbn: LogicalBlock) -> Option<DiskAddr> {
        self.inner
            .lock()
            .get(&file)
            .and_then(|meta| meta.blocks.get(&lbn).copied())
    }

    pub fn mark_modified(&self, file: FileId) {
        self.inner.lock().entry(file).or_default().modified = true;
    }

    #[must_use]
    pub fn is_modified(&self, file: FileId) -> bool {
        self.inner.lock().get(&file).is_some_and(|meta| meta.modified)
    }

    /// Point `lbn` at `addr`, dirtying its indirect chain.
    pub fn set_block_addr(&self, file: FileId, lbn: LogicalBlock, addr: DiskAddr) {
        let chain = indirect_chain(lbn, self.geometry.pointers_per_block());
        let mut inner = self.inner.lock();
        let meta = inner.entry(file).or_default();
        meta.blocks.insert(lbn, addr);
        meta.modified = true;
        meta.dirty_indirect.extend(chain);
        trace!(
            target: "lfs::segment",
            event = "block_addr_updated",
            file = file.0,
            lbn = lbn.0,
            addr = addr.0
        );
    }

    pub fn set_indirect_addr(&self, file: FileId, key: IndirectKey, addr: DiskAddr) {
        let mut inner = self.inner.lock();
        let meta = inner.entry(file).or_default();
        meta.indirect.insert(key, addr);
        meta.modified = true;
    }

    pub fn set_inode_addr(&self, file: FileId, addr: DiskAddr) {
        let mut inner = self.inner.lock();
        let meta = inner.entry(file).or_default();
        meta.inode_addr = Some(addr);
        meta.modified = false;
    }

    #[must_use]
    pub fn has_dirty_indirect(&self, file: FileId) -> bool {
        self.inner
            .lock()
            .get(&file)
            .is_some_and(|meta| !meta.dirty_indirect.is_empty())
    }

    /// Remove and return the dirty indirect blocks of `level` for `file`,
    /// each paired with its encoded contents.
    pub fn take_dirty_indirect(&self, file: FileId, level: u8) -> Vec<(IndirectKey, Vec<u8>)> {
        let nindir = self.geometry.pointers_per_block();
        let mut inner = self.inner.lock();
        let Some(meta) = inner.get_mut(&file) else {
            return Vec::new();
        };
        let keys: Vec<IndirectKey> = meta
            .dirty_indirect
            .iter()
            .filter(|key| key.level == level)
            .copied()
            .collect();
        let mut taken = Vec::with_capacity(keys.len());
        for key in keys {
            meta.dirty_indirect.remove(&key);
            let mut payload = Vec::new();
            for (lbn, addr) in &meta.blocks {
                if indirect_chain(*lbn, nindir).contains(&key) {
                    payload.extend_from_slice(&lbn.0.to_le_bytes());
                    payload.extend_from_slice(&addr.0.to_le_bytes());
                }
            }
            taken.push((key, payload));
        }
        taken
    }

    /// Mark `keys` dirty again after a gather could not take them.
    pub fn redirty_indirect(&self, file: FileId, keys: &[IndirectKey]) {
        let mut inner = self.inner.lock();
        let meta = inner.entry(file).or_default();
        meta.dirty_indirect.extend(keys.iter().copied());
    }

    /// Encoded inode record: version, block count, then `(lbn, addr)` pairs.
    #[must_use]
    pub fn encode_inode(&self, file: FileId) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        out.extend_from_slice(&file.0.to_le_bytes());
        let Some(meta) = inner.get(&file) else {
            return out;
        };
        out.extend_from_slice(&meta.version.to_le_bytes());
        out.extend_from_slice(&(meta.blocks.len() as u64).to_le_bytes());
        for (lbn, addr) in &meta.blocks {
            out.extend_from_slice(&lbn.0.to_le_bytes());
            out.extend_from_slice(&addr.0.to_le_bytes());
        }
        out
    }
}
