//! Generic range reclaimer.
//!
//! Walks the resident blocks of a byte range. Clean blocks are freed when
//! asked; dirty blocks are busied, cleaned, and handed to a [`PageWriter`]
//! that takes ownership of the write. Pages handed off stay busy until the
//! writer reports completion through [`FileCache::complete_write`].

use crate::file::{FileCache, FileState};
use lfs_error::Result;
use lfs_types::{FileId, PageId};
use parking_lot::MutexGuard;
use tracing::trace;

/// Options for one [`FileCache::put_range`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutFlags {
    /// Write dirty blocks out through the writer.
    pub clean: bool,
    /// Free clean blocks (and written ones once their write completes).
    pub free: bool,
    /// Return the first busy page instead of waiting on it.
    pub busy_fail: bool,
}

/// Outcome of a reclaim pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// Every resident block of the range was handled.
    Done,
    /// Stopped at a busy page.
    Busy(PageId),
    /// Stopped at a dirty block the writer refused; the block is dirty again.
    Refused(PageId),
    /// The writer has no room left.
    Full,
}

/// A dirty block handed to a [`PageWriter`]: page offsets and their bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite {
    pub file: FileId,
    pub offset: u64,
    pub pages: Vec<u64>,
    pub data: Vec<u8>,
    pub free_after_write: bool,
}

/// What a writer did with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVerdict {
    /// Taken; the writer will call `complete_write` for its pages.
    Accepted,
    /// Not written; the pages must be put back dirty.
    Refused,
    /// Not written because the writer is full.
    Full,
}

/// Destination for dirty blocks found by [`FileCache::put_range`].
///
/// Called with the file lock released and the block's pages busy.
pub trait PageWriter {
    fn write_block(&mut self, block: BlockWrite) -> Result<WriteVerdict>;
}

/// Writer that refuses every block.
///
/// Used where the caller believes the range is clean; any dirty block it
/// missed comes back as [`PutResult::Refused`] so the caller can write it.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefuseWrites;

impl PageWriter for RefuseWrites {
    fn write_block(&mut self, _block: BlockWrite) -> Result<WriteVerdict> {
        Ok(WriteVerdict::Refused)
    }
}

impl FileCache {
    /// Reclaim the resident blocks of `[start, end)`.
    pub fn put_range(
        &self,
        start: u64,
        end: u64,
        flags: PutFlags,
        writer: &mut dyn PageWriter,
    ) -> Result<PutResult> {
        let geo = self.geometry();
        let mut state = self.lock();
        let mut cursor = start;

        while cursor < end {
            let Some(first) = state.resident_offsets(cursor..end).next() else {
                break;
            };
            let block_start = geo.block_round_down(first).max(cursor);
            let block_end = geo
                .block_round_down(first)
                .saturating_add(geo.block_stride());
            let offsets = state.offsets_in(block_start..block_end);

            let busy = offsets
                .iter()
                .copied()
                .find(|off| state.page(*off).is_some_and(|p| p.is_busy()));
            if let Some(busy) = busy {
                if flags.busy_fail {
                    return Ok(PutResult::Busy(PageId::new(self.id(), busy)));
                }
                self.wait_for_page(&mut state, busy, None);
                continue;
            }

            let needs_write = offsets
                .iter()
                .any(|off| state.page(*off).is_some_and(|p| p.needs_write()));

            if needs_write && flags.clean {
                let block = self.busy_for_write(&mut state, block_start, &offsets, flags.free);
                let verdict = MutexGuard::unlocked(&mut state, || writer.write_block(block));
                match verdict {
                    Ok(WriteVerdict::Accepted) => {}
                    Ok(WriteVerdict::Refused) => {
                        self.abort_write(&mut state, &offsets);
                        return Ok(PutResult::Refused(PageId::new(self.id(), offsets[0])));
                    }
                    Ok(WriteVerdict::Full) => {
                        self.abort_write(&mut state, &offsets);
                        return Ok(PutResult::Full);
                    }
                    Err(err) => {
                        self.abort_write(&mut state, &offsets);
                        return Err(err);
                    }
                }
            } else if flags.free {
                let pinned = offsets
                    .iter()
                    .any(|off| state.page(*off).is_some_and(|p| p.is_wired()));
                if !pinned {
                    for off in &offsets {
                        let _ = state.remove_page(*off);
                    }
                    trace!(
                        target: "lfs::cache",
                        event = "block_freed",
                        file = self.id().0,
                        offset = block_start,
                        discarded_dirty = needs_write
                    );
                }
            }
            cursor = block_end;
        }
        Ok(PutResult::Done)
    }

    fn busy_for_write(
        &self,
        state: &mut FileState,
        block_start: u64,
        offsets: &[u64],
        free_after_write: bool,
    ) -> BlockWrite {
        let mut data = Vec::with_capacity(offsets.len() * self.geometry().page_size() as usize);
        for off in offsets {
            if let Some(page) = state.page_mut(*off) {
                page.set_busy("putpages");
                page.unmap();
                let _ = page.clear_modify();
                page.mark_clean();
                data.extend_from_slice(page.data());
            }
        }
        BlockWrite {
            file: self.id(),
            offset: block_start,
            pages: offsets.to_vec(),
            data,
            free_after_write,
        }
    }

    fn abort_write(&self, state: &mut FileState, offsets: &[u64]) {
        for off in offsets {
            if let Some(page) = state.page_mut(*off) {
                page.mark_dirty();
            }
        }
        self.release_busy(state, offsets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfs_types::Geometry;

    #[derive(Default)]
    struct Collect {
        blocks: Vec<BlockWrite>,
    }

    impl PageWriter for Collect {
        fn write_block(&mut self, block: BlockWrite) -> Result<WriteVerdict> {
            self.blocks.push(block);
            Ok(WriteVerdict::Accepted)
        }
    }

    fn cache() -> FileCache {
        FileCache::new(FileId(3), Geometry::new(4096, 8192).unwrap())
    }

    #[test]
    fn clean_blocks_are_freed() {
        let file = cache();
        let _ = file.fault(0, false);
        let flags = PutFlags {
            clean: true,
            free: true,
            busy_fail: true,
        };
        let result = file.put_range(0, 8192, flags, &mut RefuseWrites).unwrap();
        assert_eq!(result, PutResult::Done);
        assert_eq!(file.lock().npages(), 0);
    }

    #[test]
    fn refused_dirty_block_is_restored() {
        let file = cache();
        file.write(4096, b"dirty");
        let flags = PutFlags {
            clean: true,
            free: true,
            busy_fail: true,
        };
        let result = file.put_range(0, 8192, flags, &mut RefuseWrites).unwrap();
        assert_eq!(result, PutResult::Refused(PageId::new(FileId(3), 0)));
        let state = file.lock();
        assert_eq!(state.npages(), 2);
        assert!(state.pages().all(|(_, p)| p.is_dirty() && !p.is_busy()));
    }

    #[test]
    fn accepted_block_stays_busy_until_completion() {
        let file = cache();
        file.write(0, b"abc");
        let mut writer = Collect::default();
        let flags = PutFlags {
            clean: true,
            free: false,
            busy_fail: true,
        };
        assert_eq!(
            file.put_range(0, 8192, flags, &mut writer).unwrap(),
            PutResult::Done
        );
        assert_eq!(writer.blocks.len(), 1);
        assert_eq!(writer.blocks[0].pages, vec![0, 4096]);
        assert_eq!(writer.blocks[0].data.len(), 8192);
        assert!(file.lock().pages().all(|(_, p)| p.is_busy() && !p.is_dirty()));

        file.start_output(1);
        file.complete_write(&writer.blocks[0].pages, false, true);
        assert!(file.lock().pages().all(|(_, p)| !p.is_busy()));
    }

    #[test]
    fn busy_page_fails_fast_when_asked() {
        let file = cache();
        file.write(0, b"abc");
        assert!(file.try_busy(4096, "other"));
        let flags = PutFlags {
            clean: true,
            free: false,
            busy_fail: true,
        };
        let result = file
            .put_range(0, 8192, flags, &mut Collect::default())
            .unwrap();
        assert_eq!(result, PutResult::Busy(PageId::new(FileId(3), 4096)));
    }

    #[test]
    fn invalidation_discards_dirty_pages() {
        let file = cache();
        file.write(0, b"gone");
        let flags = PutFlags {
            clean: false,
            free: true,
            busy_fail: false,
        };
        assert_eq!(
            file.put_range(0, 8192, flags, &mut RefuseWrites).unwrap(),
            PutResult::Done
        );
        assert_eq!(file.lock().npages(), 0);
    }
}
