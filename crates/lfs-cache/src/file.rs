//! Per-file page cache, its lock, and the busy-page waiter.

use crate::page::Page;
use lfs_types::{FileId, Geometry, PageId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, trace};

/// Page state of one file. Only reachable through [`FileCache::lock`].
#[derive(Debug)]
pub struct FileState {
    id: FileId,
    pages: BTreeMap<u64, Page>,
    size: u64,
    /// Device writes issued for this file and not yet completed.
    num_output: usize,
}

impl FileState {
    #[must_use]
    pub fn id(&self) -> FileId {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn page(&self, offset: u64) -> Option<&Page> {
        self.pages.get(&offset)
    }

    pub fn page_mut(&mut self, offset: u64) -> Option<&mut Page> {
        self.pages.get_mut(&offset)
    }

    /// Resident pages in offset order.
    pub fn pages(&self) -> impl Iterator<Item = (u64, &Page)> {
        self.pages.iter().map(|(off, page)| (*off, page))
    }

    /// Resident page offsets in `range`, ascending.
    pub fn resident_offsets(&self, range: Range<u64>) -> impl Iterator<Item = u64> + '_ {
        let range = if range.start < range.end { range } else { 0..0 };
        self.pages.range(range).map(|(off, _)| *off)
    }

    /// Offsets of resident pages in `range`, in order.
    #[must_use]
    pub fn offsets_in(&self, range: Range<u64>) -> Vec<u64> {
        self.resident_offsets(range).collect()
    }

    /// Whether any resident page still needs a write.
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.pages.values().any(Page::needs_write)
    }

    #[must_use]
    pub fn num_output(&self) -> usize {
        self.num_output
    }

    pub(crate) fn remove_page(&mut self, offset: u64) -> Option<Page> {
        self.pages.remove(&offset)
    }

    /// Make every page of the block starting at `block_start` resident.
    fn ensure_block(&mut self, geometry: Geometry, block_start: u64) {
        let page_size = geometry.page_size();
        for i in 0..geometry.pages_per_block() {
            let off = block_start + i * page_size;
            self.pages
                .entry(off)
                .or_insert_with(|| Page::zeroed(page_size));
        }
    }
}

/// Cached pages of one file plus the lock and wake channel guarding them.
#[derive(Debug)]
pub struct FileCache {
    id: FileId,
    geometry: Geometry,
    state: Mutex<FileState>,
    wakeup: Condvar,
}

impl FileCache {
    #[must_use]
    pub fn new(id: FileId, geometry: Geometry) -> Self {
        Self {
            id,
            geometry,
            state: Mutex::new(FileState {
                id,
                pages: BTreeMap::new(),
                size: 0,
                num_output: 0,
            }),
            wakeup: Condvar::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> FileId {
        self.id
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Take the file lock. All page-state inspection happens under it.
    pub fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock()
    }

    /// Block until the page at `offset` is free or gone, releasing the file
    /// lock while asleep and re-taking it on wake.
    ///
    /// A `label` turns on ownership diagnostics for the wait.
    pub fn wait_for_page(
        &self,
        state: &mut MutexGuard<'_, FileState>,
        offset: u64,
        label: Option<&str>,
    ) {
        let Some(page) = state.page(offset) else {
            return;
        };
        if !page.is_busy() {
            return;
        }
        let page_id = PageId::new(self.id, offset);
        if let Some(label) = label {
            debug!(
                target: "lfs::cache",
                event = "wait_for_page",
                label,
                page = %page_id,
                owner = page.owner().unwrap_or("unowned")
            );
        } else {
            trace!(
                target: "lfs::cache",
                event = "wait_for_page",
                page = %page_id,
                owner = page.owner().unwrap_or("unowned")
            );
        }
        while state.page(offset).is_some_and(Page::is_busy) {
            self.wakeup.wait(state);
        }
    }

    /// Release busy on `offsets` and wake anyone waiting on them.
    pub fn release_busy(&self, state: &mut FileState, offsets: &[u64]) {
        for off in offsets {
            if let Some(page) = state.page_mut(*off) {
                page.clear_busy();
            }
        }
        self.wakeup.notify_all();
    }

    /// Busy a free resident page on behalf of `owner`.
    pub fn try_busy(&self, offset: u64, owner: &'static str) -> bool {
        let mut state = self.lock();
        match state.page_mut(offset) {
            Some(page) if !page.is_busy() => {
                page.set_busy(owner);
                true
            }
            _ => false,
        }
    }

    pub fn unbusy(&self, offset: u64) {
        let mut state = self.lock();
        self.release_busy(&mut state, &[offset]);
    }

    /// Set the file size.
    ///
    /// Shrinking drops every page of the blocks wholly past the new end of
    /// file, dirty or not, after waiting out any that are busy.
    pub fn set_size(&self, size: u64) {
        let mut state = self.lock();
        if size < state.size {
            let blkeof = self.geometry.block_round_up(size);
            loop {
                let busy = state
                    .resident_offsets(blkeof..u64::MAX)
                    .find(|off| state.page(*off).is_some_and(Page::is_busy));
                let Some(busy) = busy else {
                    break;
                };
                self.wait_for_page(&mut state, busy, None);
            }
            let dropped = state.offsets_in(blkeof..u64::MAX);
            for off in &dropped {
                let _ = state.remove_page(*off);
            }
            trace!(
                target: "lfs::cache",
                event = "truncate",
                file = self.id.0,
                size,
                dropped = dropped.len()
            );
        }
        state.size = size;
    }

    /// Buffered write: dirty the touched pages, keeping whole blocks resident.
    pub fn write(&self, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let geo = self.geometry;
        let page_size = geo.page_size();
        let end = offset.saturating_add(bytes.len() as u64);
        let mut state = self.lock();
        let mut page_off = geo.page_round_down(offset);
        while page_off < end {
            loop {
                state.ensure_block(geo, geo.block_round_down(page_off));
                if state.page(page_off).is_some_and(Page::is_busy) {
                    self.wait_for_page(&mut state, page_off, None);
                    continue;
                }
                break;
            }
            let copy_start = offset.max(page_off);
            let copy_end = end.min(page_off + page_size);
            if let Some(page) = state.page_mut(page_off) {
                let dst = usize::try_from(copy_start - page_off).unwrap_or(0);
                let src = usize::try_from(copy_start - offset).unwrap_or(0);
                let len = usize::try_from(copy_end - copy_start).unwrap_or(0);
                page.data_mut()[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
                page.mark_dirty();
            }
            page_off += page_size;
        }
        state.size = state.size.max(end);
        trace!(
            target: "lfs::cache",
            event = "buffered_write",
            file = self.id.0,
            offset,
            len = bytes.len(),
            size = state.size
        );
    }

    /// Copy `len` bytes at `offset`; holes read as zeros.
    #[must_use]
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let page_size = self.geometry.page_size();
        let mut out = vec![0_u8; len];
        let end = offset.saturating_add(len as u64);
        let state = self.lock();
        for (page_off, page) in state
            .pages
            .range(self.geometry.page_round_down(offset)..end)
        {
            let from = offset.max(*page_off);
            let to = end.min(page_off + page_size);
            if from >= to {
                continue;
            }
            let src = usize::try_from(from - page_off).unwrap_or(0);
            let dst = usize::try_from(from - offset).unwrap_or(0);
            let n = usize::try_from(to - from).unwrap_or(0);
            out[dst..dst + n].copy_from_slice(&page.data()[src..src + n]);
        }
        out
    }

    /// Fault in the page containing `offset`, reading in its whole block, and
    /// map it. A write fault sets the hardware-modified bit and, past end of
    /// file, extends the file to the end of the page.
    #[must_use]
    pub fn fault(&self, offset: u64, write: bool) -> Vec<u8> {
        let geo = self.geometry;
        let page_off = geo.page_round_down(offset);
        let mut state = self.lock();
        loop {
            state.ensure_block(geo, geo.block_round_down(page_off));
            if state.page(page_off).is_some_and(Page::is_busy) {
                self.wait_for_page(&mut state, page_off, None);
                continue;
            }
            break;
        }
        let Some(page) = state.page_mut(page_off) else {
            return Vec::new();
        };
        page.map();
        if write {
            page.set_modified();
        }
        let data = page.data().to_vec();
        if write {
            state.size = state.size.max(page_off + geo.page_size());
        }
        data
    }

    /// Account for `blocks` device writes about to be issued.
    pub fn start_output(&self, blocks: usize) {
        let mut state = self.lock();
        state.num_output = state.num_output.saturating_add(blocks);
    }

    /// Completion of one block write covering `offsets`.
    ///
    /// On success the pages come back clean and unwired, and are freed when
    /// `free` is set. On failure they are re-dirtied so a later pass retries.
    pub fn complete_write(&self, offsets: &[u64], free: bool, ok: bool) {
        let mut state = self.lock();
        for off in offsets {
            if let Some(page) = state.page_mut(*off) {
                page.clear_busy();
                page.resume_write();
                if !ok {
                    page.mark_dirty();
                }
            }
        }
        if ok && free {
            for off in offsets {
                let freeable = state
                    .page(*off)
                    .is_some_and(|p| !p.needs_write() && !p.is_wired() && !p.is_busy());
                if freeable {
                    let _ = state.remove_page(*off);
                }
            }
        }
        state.num_output = state.num_output.saturating_sub(1);
        drop(state);
        self.wakeup.notify_all();
    }

    /// Block until every issued device write for this file has completed.
    pub fn wait_for_output(&self) {
        let mut state = self.lock();
        while state.num_output > 0 {
            debug!(
                target: "lfs::cache",
                event = "wait_for_output",
                file = self.id.0,
                outstanding = state.num_output
            );
            self.wakeup.wait(&mut state);
        }
    }
}
