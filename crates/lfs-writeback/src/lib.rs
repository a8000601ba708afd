#![forbid(unsafe_code)]
//! Dirty-page gathering and segment write-back for a log-structured
//! filesystem.
//!
//! An [`Lfs`] instance ties the page cache, the inode block maps and the
//! segment lock together and exposes the write-back coordinator
//! ([`Lfs::putpages`] / [`Lfs::putpages_locked`]), the read-path guard
//! ([`Lfs::getpages`]), the directory-operation checkpoint and the paging
//! queue drained by the [`WriterDaemon`].
//!
//! # Example
//!
//! ```
//! use lfs_writeback::{FileId, Lfs, PutRequest, Writeback, WritebackConfig};
//!
//! let (lfs, log) = Lfs::with_memory_log(WritebackConfig::default(), 4096).unwrap();
//! lfs.create_file(FileId(10)).unwrap();
//! lfs.write(FileId(10), 0, b"hello").unwrap();
//! assert_eq!(lfs.putpages(FileId(10), PutRequest::sync_all()).unwrap(), Writeback::Done);
//! assert_eq!(log.partial_count(), 1);
//! ```

mod breaker;
mod classify;
mod config;
mod daemon;
mod dirop;
mod getpages;
mod paging;
mod putpages;
mod stats;

pub use classify::{Classification, ClassifyMode, blocks_uniform, check_dirty};
pub use config::WritebackConfig;
pub use daemon::WriterDaemon;
pub use dirop::{DiropTable, WriterGate};
pub use getpages::Access;
pub use paging::{PagingQueue, Wake, WriterSignal};
pub use putpages::{Caller, PutPagesFlags, PutRequest, Writeback};
pub use stats::{StatsSnapshot, WritebackStats};

pub use lfs_cache::{FileCache, Page, PageCache};
pub use lfs_error::{LfsError, Result};
pub use lfs_segment::{
    FileLogDevice, InodeTable, LockMode, LogDevice, MemLogDevice, PartialRecord, SS_CONT,
    SS_DIROP, SegmentGuard, SegmentLock,
};
pub use lfs_types::{DiskAddr, FileId, Geometry, LogicalBlock, PageId};

use lfs_segment::Segment;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// One mounted filesystem's write-back state.
#[derive(Debug)]
pub struct Lfs {
    config: WritebackConfig,
    geometry: Geometry,
    cache: Arc<PageCache>,
    inodes: Arc<InodeTable>,
    device: Arc<dyn LogDevice>,
    seglock: SegmentLock,
    paging: PagingQueue,
    writer: WriterSignal,
    dirops: DiropTable,
    stats: WritebackStats,
    read_only: AtomicBool,
}

impl Lfs {
    /// Build an instance appending to `device` from its first block.
    pub fn new(config: WritebackConfig, device: Arc<dyn LogDevice>) -> Result<Self> {
        let geometry = config.geometry()?;
        if u64::from(device.block_size()) != geometry.block_size() {
            return Err(LfsError::InvalidGeometry(format!(
                "log device block size {} does not match block_size {}",
                device.block_size(),
                geometry.block_size()
            )));
        }
        let cache = Arc::new(PageCache::new(geometry));
        let inodes = Arc::new(InodeTable::new(geometry));
        cache.insert_file(FileId::IFILE);
        inodes.insert(FileId::IFILE);
        let segment = Segment::new(
            Arc::clone(&cache),
            Arc::clone(&inodes),
            Arc::clone(&device),
            config.segment_blocks,
            DiskAddr(0),
        );
        info!(
            target: "lfs::writer",
            event = "instance_created",
            page_size = geometry.page_size(),
            block_size = geometry.block_size(),
            segment_blocks = config.segment_blocks,
            log_blocks = device.capacity_blocks()
        );
        Ok(Self {
            config,
            geometry,
            cache,
            inodes,
            device,
            seglock: SegmentLock::new(segment),
            paging: PagingQueue::new(),
            writer: WriterSignal::new(),
            dirops: DiropTable::new(),
            stats: WritebackStats::default(),
            read_only: AtomicBool::new(false),
        })
    }

    /// Instance over a fresh in-memory log of `capacity_blocks` blocks.
    pub fn with_memory_log(
        config: WritebackConfig,
        capacity_blocks: u64,
    ) -> Result<(Self, Arc<MemLogDevice>)> {
        let block_size = u32::try_from(config.geometry()?.block_size())
            .map_err(|_| LfsError::InvalidGeometry("block_size does not fit u32".to_owned()))?;
        let device = Arc::new(MemLogDevice::new(block_size, capacity_blocks));
        let lfs = Self::new(config, Arc::clone(&device) as Arc<dyn LogDevice>)?;
        Ok((lfs, device))
    }

    #[must_use]
    pub fn config(&self) -> &WritebackConfig {
        &self.config
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    #[must_use]
    pub fn inodes(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn LogDevice> {
        &self.device
    }

    #[must_use]
    pub fn seglock(&self) -> &SegmentLock {
        &self.seglock
    }

    #[must_use]
    pub fn paging(&self) -> &PagingQueue {
        &self.paging
    }

    #[must_use]
    pub fn writer_signal(&self) -> &WriterSignal {
        &self.writer
    }

    #[must_use]
    pub fn dirops(&self) -> &DiropTable {
        &self.dirops
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Register `file` with the cache and the inode table. Idempotent.
    pub fn create_file(&self, file: FileId) -> Result<Arc<FileCache>> {
        if self.is_read_only() {
            return Err(LfsError::ReadOnly);
        }
        self.inodes.insert(file);
        Ok(self.cache.insert_file(file))
    }

    /// Forget `file` entirely. Its dirty pages are discarded.
    pub fn remove_file(&self, file: FileId) -> Result<()> {
        if file.is_ifile() {
            return Err(LfsError::NotPermitted);
        }
        self.paging.dequeue(file);
        self.cache
            .remove_file(file)
            .ok_or_else(|| LfsError::NotFound(file.to_string()))?;
        self.inodes.remove(file);
        Ok(())
    }

    /// Buffered write through the page cache.
    pub fn write(&self, file: FileId, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.is_read_only() {
            return Err(LfsError::ReadOnly);
        }
        if file.is_ifile() {
            return Err(LfsError::NotPermitted);
        }
        self.cache.file(file)?.write(offset, bytes);
        self.inodes.mark_modified(file);
        Ok(())
    }

    pub fn set_size(&self, file: FileId, size: u64) -> Result<()> {
        if self.is_read_only() {
            return Err(LfsError::ReadOnly);
        }
        self.cache.file(file)?.set_size(size);
        self.inodes.mark_modified(file);
        Ok(())
    }

    pub fn read(&self, file: FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.cache.file(file)?.read(offset, len))
    }

    /// Start a directory operation covering `files`.
    pub fn begin_dirop(&self, files: &[FileId]) {
        self.dirops.begin(files);
    }

    pub fn end_dirop(&self) {
        self.dirops.end();
    }
}
