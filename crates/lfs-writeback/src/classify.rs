//! Dirty-block classifier.
//!
//! Scans a byte range block by block and makes every block's pages agree on
//! one dirty state. A block is dirty if any of its pages carries the
//! software dirty flag or a hardware-modified bit; the decision is then
//! forced onto all of its pages, so no caller ever observes a half-dirty
//! block.
//!
//! Busy pages are the interesting part. A caller that may wait drops the
//! pages it has already busied, sleeps on the page, and rescans from the
//! top. A caller holding the segment lock, or the evictor, must not sleep
//! here: the page may be held by a thread that is itself waiting for the
//! segment lock. Those callers get [`Classification::HardStop`] instead.

use lfs_cache::{FileCache, Page};
use lfs_types::PageId;
use std::ops::Range;
use tracing::trace;

/// Who is asking, and what to do with dirty blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyMode {
    /// The caller holds the segment lock.
    pub seg_locked: bool,
    /// The caller is the memory-pressure evictor.
    pub evictor: bool,
    /// Return as soon as one dirty block is found.
    pub first_dirty_only: bool,
    /// Wire dirty pages and mark their write suspended.
    pub suspend_dirty: bool,
}

impl ClassifyMode {
    fn must_not_wait(self) -> bool {
        self.seg_locked || self.evictor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Number of dirty blocks seen; every inspected block is uniform.
    Dirty(usize),
    /// A busy page this caller may not wait on.
    HardStop(PageId),
}

/// Classify the resident blocks of `range`, looking no further than `blkeof`
/// (end of file rounded up to a block).
///
/// `penalty` weighs the ordered walk over resident pages against probing
/// every block offset in the range; sparse files with huge ranges take the
/// ordered walk.
pub fn check_dirty(
    file: &FileCache,
    range: Range<u64>,
    blkeof: u64,
    mode: ClassifyMode,
    penalty: u64,
) -> Classification {
    let geo = file.geometry();
    let page_size = geo.page_size();
    let pages_per_block = geo.pages_per_block();
    let stride = geo.block_stride();
    let limit = blkeof.min(range.end);
    let mut state = file.lock();

    'top: loop {
        let range_pages = range.end.saturating_sub(range.start) >> geo.page_shift();
        let by_list = state.npages() as u64 <= range_pages.saturating_mul(penalty);
        let mut any_dirty = 0_usize;
        let mut cursor = range.start;

        loop {
            let block_start = if by_list {
                let size = state.size();
                let found = state
                    .resident_offsets(cursor..range.end.min(size))
                    .find(|off| geo.is_block_aligned(*off));
                match found {
                    Some(off) => off,
                    None => break,
                }
            } else {
                if cursor >= limit {
                    break;
                }
                cursor
            };

            let mut taken: Vec<u64> = Vec::with_capacity(pages_per_block as usize);
            let mut missing = 0_u64;
            let mut dirty = false;
            for i in 0..pages_per_block {
                let off = block_start + i * page_size;
                let Some(page) = state.page(off) else {
                    missing += 1;
                    continue;
                };
                if page.is_busy() {
                    file.release_busy(&mut state, &taken);
                    let busy = PageId::new(file.id(), off);
                    if mode.must_not_wait() {
                        trace!(
                            target: "lfs::classify",
                            event = "hard_stop",
                            page = %busy,
                            seg_locked = mode.seg_locked,
                            evictor = mode.evictor
                        );
                        return Classification::HardStop(busy);
                    }
                    file.wait_for_page(&mut state, off, None);
                    continue 'top;
                }
                if let Some(page) = state.page_mut(off) {
                    page.set_busy("check_dirty");
                    page.unmap();
                    let hw = page.clear_modify();
                    dirty |= hw || page.is_dirty();
                    taken.push(off);
                }
            }

            if missing >= pages_per_block {
                cursor = block_start + stride;
                continue;
            }
            assert!(
                missing == 0,
                "{} block at {block_start:#x} is partially resident",
                file.id()
            );

            for off in &taken {
                if let Some(page) = state.page_mut(*off) {
                    if dirty {
                        page.mark_dirty();
                        if mode.suspend_dirty {
                            page.suspend_write();
                        }
                    }
                    debug_assert!(page.is_dirty() || !page.is_delwri());
                }
            }
            file.release_busy(&mut state, &taken);
            trace!(
                target: "lfs::classify",
                event = "block_classified",
                file = file.id().0,
                offset = block_start,
                dirty
            );

            if dirty {
                any_dirty += 1;
                if mode.first_dirty_only {
                    break;
                }
            }
            cursor = block_start + stride;
        }
        return Classification::Dirty(any_dirty);
    }
}

/// Whether every resident block in `range` is uniformly dirty or clean.
#[must_use]
pub fn blocks_uniform(file: &FileCache, range: Range<u64>) -> bool {
    let geo = file.geometry();
    let state = file.lock();
    let mut blocks: Vec<(u64, bool)> = Vec::new();
    for off in state.resident_offsets(range) {
        let dirty = state.page(off).is_some_and(Page::needs_write);
        let block = geo.block_round_down(off);
        match blocks.last() {
            Some((start, first)) if *start == block => {
                if *first != dirty {
                    return false;
                }
            }
            _ => blocks.push((block, dirty)),
        }
    }
    true
}
