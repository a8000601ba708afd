//! The active partial segment.
//!
//! Blocks are gathered in order, given consecutive log addresses by
//! [`Segment::update_meta`], and written out with a summary block by
//! [`Segment::write_segment`]. A partial segment always reserves the address
//! at its start for its summary.

use crate::device::LogDevice;
use crate::inode::InodeTable;
use lfs_cache::{BlockWrite, PageCache, PageWriter, WriteVerdict};
use lfs_error::Result;
use lfs_types::{DiskAddr, FileId, IndirectKey, LogicalBlock, NIADDR};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Summary flag: the partial segment carries directory-operation state.
pub const SS_DIROP: u16 = 0x01;
/// Summary flag: the directory operation continues in the next partial.
pub const SS_CONT: u16 = 0x02;

const SUMMARY_MAGIC: u32 = 0x5345_4753;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data(LogicalBlock),
    Indirect(IndirectKey),
    Inode,
}

#[derive(Debug)]
struct GatheredBlock {
    file: FileId,
    kind: BlockKind,
    data: Vec<u8>,
    /// Cache pages backing a data block; empty for metadata.
    pages: Vec<u64>,
    free_after_write: bool,
    addr: Option<DiskAddr>,
}

/// Per-file slot in the segment summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file: FileId,
    pub version: u32,
    pub blocks: Vec<LogicalBlock>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub partials_written: u64,
    pub blocks_written: u64,
    /// Partials flushed because the segment filled mid-gather.
    pub auto_flushes: u64,
}

#[derive(Debug)]
pub struct Segment {
    cache: Arc<PageCache>,
    inodes: Arc<InodeTable>,
    device: Arc<dyn LogDevice>,
    capacity: usize,
    single_file: bool,
    start: DiskAddr,
    next: DiskAddr,
    blocks: Vec<GatheredBlock>,
    finfos: Vec<FileInfo>,
    current: Option<FileInfo>,
    active_file: Option<FileId>,
    flags: u16,
    stats: SegmentStats,
}

impl Segment {
    /// Start appending at `log_start` with room for `capacity` blocks per
    /// partial segment.
    #[must_use]
    pub fn new(
        cache: Arc<PageCache>,
        inodes: Arc<InodeTable>,
        device: Arc<dyn LogDevice>,
        capacity: usize,
        log_start: DiskAddr,
    ) -> Self {
        Self {
            cache,
            inodes,
            device,
            capacity: capacity.max(1),
            single_file: false,
            start: log_start,
            next: log_start.next(),
            blocks: Vec::new(),
            finfos: Vec::new(),
            current: None,
            active_file: None,
            flags: 0,
            stats: SegmentStats::default(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn LogDevice> {
        &self.device
    }

    #[must_use]
    pub fn stats(&self) -> SegmentStats {
        self.stats
    }

    /// Next free log address.
    #[must_use]
    pub fn log_position(&self) -> DiskAddr {
        self.next
    }

    #[must_use]
    pub fn is_single_file(&self) -> bool {
        self.single_file
    }

    pub fn set_single_file(&mut self, single: bool) {
        self.single_file = single;
    }

    /// Buffers queued in the partial segment, counting its summary block.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.blocks.len() + 1
    }

    #[must_use]
    pub fn summary_flags(&self) -> u16 {
        self.flags
    }

    pub fn mark_dirop(&mut self) {
        self.flags |= SS_DIROP | SS_CONT;
    }

    /// The last partial of a directory-operation checkpoint: clear `SS_CONT`.
    pub fn end_dirop(&mut self) {
        self.flags &= !SS_CONT;
    }

    /// Blocks queued but not yet written.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.blocks.is_empty()
    }

    #[must_use]
    pub fn active_file(&self) -> Option<FileId> {
        self.active_file
    }

    pub fn set_active_file(&mut self, file: Option<FileId>) {
        self.active_file = file;
    }

    /// Open a summary slot for `file`.
    pub fn acquire_finfo(&mut self, file: FileId) {
        if self.current.is_some() {
            self.release_finfo();
        }
        self.current = Some(FileInfo {
            file,
            version: self.inodes.version(file),
            blocks: Vec::new(),
        });
    }

    /// Close the open slot; empty slots are dropped.
    pub fn release_finfo(&mut self) {
        if let Some(info) = self.current.take() {
            if !info.blocks.is_empty() {
                self.finfos.push(info);
            }
        }
    }

    #[must_use]
    pub fn current_finfo(&self) -> Option<&FileInfo> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    /// Whether another data or indirect block fits. A single-file segment
    /// keeps its last slot for the inode record written after the data.
    fn has_data_room(&self) -> bool {
        let reserved = usize::from(self.single_file);
        self.blocks.len() + reserved < self.capacity
    }

    /// Gather the dirty indirect blocks of `level` for `file`.
    ///
    /// Returns how many were queued. A full single-file segment stops early;
    /// the rest stay dirty for a later pass.
    pub fn gather_indirect(&mut self, file: FileId, level: u8) -> Result<usize> {
        debug_assert!((1..=NIADDR).contains(&level));
        let pending = self.inodes.take_dirty_indirect(file, level);
        let mut gathered = 0;
        let mut pending = pending.into_iter();
        while let Some((key, data)) = pending.next() {
            if !self.has_data_room() {
                if self.single_file {
                    // Leave the rest dirty for the next pass.
                    let left: Vec<IndirectKey> = std::iter::once(key)
                        .chain(pending.by_ref().map(|(k, _)| k))
                        .collect();
                    warn!(
                        target: "lfs::segment",
                        event = "indirect_gather_truncated",
                        file = file.0,
                        level,
                        left = left.len()
                    );
                    self.inodes.redirty_indirect(file, &left);
                    break;
                }
                self.flush_full()?;
            }
            self.blocks.push(GatheredBlock {
                file,
                kind: BlockKind::Indirect(key),
                data,
                pages: Vec::new(),
                free_after_write: false,
                addr: None,
            });
            gathered += 1;
        }
        if gathered > 0 {
            trace!(
                target: "lfs::segment",
                event = "indirect_gathered",
                file = file.0,
                level,
                gathered
            );
        }
        Ok(gathered)
    }

    /// Queue an inode record for `file`.
    ///
    /// In a single-file segment this takes the slot data gathering leaves
    /// free, so one record per gathered file keeps it within capacity.
    pub fn write_inode(&mut self, file: FileId) -> Result<()> {
        if self.is_full() && !self.single_file {
            self.flush_full()?;
        }
        let data = self.inodes.encode_inode(file);
        self.blocks.push(GatheredBlock {
            file,
            kind: BlockKind::Inode,
            data,
            pages: Vec::new(),
            free_after_write: false,
            addr: None,
        });
        Ok(())
    }

    /// Assign log addresses to every unplaced block, in gather order, and
    /// record them in the inode maps.
    pub fn update_meta(&mut self) {
        let mut placed = 0_usize;
        for block in self.blocks.iter_mut().filter(|b| b.addr.is_none()) {
            let addr = self.next;
            self.next = self.next.next();
            block.addr = Some(addr);
            match block.kind {
                BlockKind::Data(lbn) => self.inodes.set_block_addr(block.file, lbn, addr),
                BlockKind::Indirect(key) => self.inodes.set_indirect_addr(block.file, key, addr),
                BlockKind::Inode => self.inodes.set_inode_addr(block.file, addr),
            }
            placed += 1;
        }
        if placed > 0 {
            debug!(
                target: "lfs::segment",
                event = "update_meta",
                placed,
                log_position = self.next.0
            );
        }
    }

    /// Write the partial segment to the device and open the next one.
    ///
    /// Returns the number of blocks written. Every block must already have
    /// an address. On device failure the pages are re-dirtied and the error
    /// is returned unchanged.
    pub fn write_segment(&mut self) -> Result<usize> {
        if self.blocks.is_empty() {
            return Ok(0);
        }
        assert!(
            self.blocks.iter().all(|b| b.addr.is_some()),
            "segment flushed before its metadata was updated"
        );

        let summary = self.encode_summary();
        for block in self.blocks.iter().filter(|b| !b.pages.is_empty()) {
            if let Ok(file) = self.cache.file(block.file) {
                file.start_output(1);
            }
        }

        let payloads: Vec<&[u8]> = self.blocks.iter().map(|b| b.data.as_slice()).collect();
        let written = self.device.write_partial(self.start, &summary, &payloads);
        let ok = written.is_ok();
        for block in self.blocks.iter().filter(|b| !b.pages.is_empty()) {
            if let Ok(file) = self.cache.file(block.file) {
                file.complete_write(&block.pages, block.free_after_write, ok);
            }
        }

        let count = self.blocks.len();
        if let Err(err) = written {
            warn!(
                target: "lfs::segment",
                event = "write_segment_failed",
                addr = self.start.0,
                blocks = count,
                error = %err
            );
            self.reset();
            return Err(err);
        }

        self.stats.partials_written += 1;
        self.stats.blocks_written += count as u64;
        debug!(
            target: "lfs::segment",
            event = "write_segment",
            addr = self.start.0,
            blocks = count,
            flags = self.flags
        );
        self.reset();
        Ok(count)
    }

    /// Open the next partial segment after the current log position.
    fn reset(&mut self) {
        self.blocks.clear();
        self.finfos.clear();
        if let Some(info) = self.current.as_mut() {
            info.blocks.clear();
        }
        self.flags = 0;
        self.start = self.next;
        self.next = self.next.next();
    }

    fn flush_full(&mut self) -> Result<()> {
        self.update_meta();
        self.write_segment()?;
        self.stats.auto_flushes += 1;
        Ok(())
    }

    fn encode_summary(&self) -> Vec<u8> {
        let finfos: Vec<&FileInfo> = self
            .finfos
            .iter()
            .chain(self.current.iter().filter(|info| !info.blocks.is_empty()))
            .collect();
        let mut out = Vec::new();
        out.extend_from_slice(&SUMMARY_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&(finfos.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for info in finfos {
            out.extend_from_slice(&info.file.0.to_le_bytes());
            out.extend_from_slice(&info.version.to_le_bytes());
            out.extend_from_slice(&(info.blocks.len() as u32).to_le_bytes());
            for lbn in &info.blocks {
                out.extend_from_slice(&lbn.0.to_le_bytes());
            }
        }
        out
    }
}

impl PageWriter for Segment {
    fn write_block(&mut self, block: BlockWrite) -> Result<WriteVerdict> {
        assert!(
            self.active_file.is_none_or(|file| file == block.file),
            "block of {} gathered while writing {:?}",
            block.file,
            self.active_file
        );
        if !self.has_data_room() {
            if self.single_file {
                return Ok(WriteVerdict::Full);
            }
            self.flush_full()?;
        }
        let lbn = self.cache.geometry().lblkno(block.offset);
        if let Some(info) = self.current.as_mut().filter(|info| info.file == block.file) {
            info.blocks.push(lbn);
        }
        trace!(
            target: "lfs::segment",
            event = "gather_block",
            file = block.file.0,
            lbn = lbn.0,
            queued = self.blocks.len() + 1
        );
        self.blocks.push(GatheredBlock {
            file: block.file,
            kind: BlockKind::Data(lbn),
            data: block.data,
            pages: block.pages,
            free_after_write: block.free_after_write,
            addr: None,
        });
        Ok(WriteVerdict::Accepted)
    }
}
