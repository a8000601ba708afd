//! Write-back coordinator.
//!
//! [`Lfs::putpages`] is the entry point for callers that do not hold the
//! segment lock: it takes the lock, gathers the range, writes the partial
//! segment and lets go. [`Lfs::putpages_locked`] runs under a lock the
//! caller already holds and only gathers and places blocks; writing the
//! segment stays with the caller.
//!
//! Both share the same front half: skip pages past EOF in the last block,
//! widen the range to block boundaries, send non-cleaning requests and the
//! metadata inode to the cache reclaimer, and take the clean fast path
//! when nothing in range is dirty.

use crate::Lfs;
use crate::breaker::write_and_wait;
use crate::classify::{Classification, ClassifyMode, check_dirty};
use lfs_cache::{FileCache, Page, PutFlags, PutResult, RefuseWrites};
use lfs_error::Result;
use lfs_segment::{LockMode, Segment, SegmentGuard};
use lfs_types::{FileId, NIADDR, PageId};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Execution context of the caller.
///
/// The evictor may never block and never writes the log itself; it also
/// decides whether a busy page is waited on or reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Caller {
    #[default]
    Thread,
    Evictor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutPagesFlags {
    /// Write dirty pages. Without it the range is only freed.
    pub clean: bool,
    /// Free pages once they are clean.
    pub free: bool,
    /// Wait for the writes to reach the device.
    pub sync: bool,
    /// Ignore the upper bound and cover the whole file.
    pub all_pages: bool,
    /// Forced flush of a file being recycled; may block longer.
    pub reclaim: bool,
}

/// One write-back request. An `end` of zero means "to the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutRequest {
    pub start: u64,
    pub end: u64,
    pub flags: PutPagesFlags,
    pub caller: Caller,
}

impl PutRequest {
    #[must_use]
    pub fn range(start: u64, end: u64, flags: PutPagesFlags) -> Self {
        Self {
            start,
            end,
            flags,
            caller: Caller::Thread,
        }
    }

    /// Write every dirty page of the file and wait for it.
    #[must_use]
    pub fn sync_all() -> Self {
        Self::range(
            0,
            0,
            PutPagesFlags {
                clean: true,
                sync: true,
                all_pages: true,
                ..PutPagesFlags::default()
            },
        )
    }

    /// Asynchronous whole-file write-back, as the writer daemon issues it.
    #[must_use]
    pub fn writeback() -> Self {
        Self::range(
            0,
            0,
            PutPagesFlags {
                clean: true,
                all_pages: true,
                ..PutPagesFlags::default()
            },
        )
    }

    /// Memory-pressure request to clean and free `[start, end)`.
    #[must_use]
    pub fn evict(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            flags: PutPagesFlags {
                clean: true,
                free: true,
                ..PutPagesFlags::default()
            },
            caller: Caller::Evictor,
        }
    }

    /// Flush and free everything before the file's cache is recycled.
    #[must_use]
    pub fn reclaim() -> Self {
        Self::range(
            0,
            0,
            PutPagesFlags {
                clean: true,
                free: true,
                sync: true,
                all_pages: true,
                reclaim: true,
            },
        )
    }

    /// Drop cached pages of `[start, end)` without writing them.
    #[must_use]
    pub fn invalidate(start: u64, end: u64) -> Self {
        Self::range(
            start,
            end,
            PutPagesFlags {
                free: true,
                ..PutPagesFlags::default()
            },
        )
    }
}

/// Outcome of a write-back request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writeback {
    Done,
    /// Nothing was written; ask again later. Only the evictor sees this,
    /// or a reclaim that found pages it must not touch.
    TryAgain,
    /// A single-file segment filled up; gathered blocks have addresses but
    /// are not written yet.
    SegmentFull,
}

impl From<PutResult> for Writeback {
    fn from(result: PutResult) -> Self {
        match result {
            PutResult::Done => Self::Done,
            PutResult::Busy(_) | PutResult::Refused(_) => Self::TryAgain,
            PutResult::Full => Self::SegmentFull,
        }
    }
}

/// A normalized request that needs the segment machinery.
#[derive(Debug)]
struct Plan {
    file: Arc<FileCache>,
    start: u64,
    end: u64,
    blkeof: u64,
    flags: PutPagesFlags,
}

enum Prepared {
    Finished(Writeback),
    Gather(Plan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gathered {
    Done,
    Full,
    /// Hard stop under a lock this call took; drop it and start over.
    Restart,
}

impl Lfs {
    /// Write back `[req.start, req.end)` of `file`, taking the segment lock.
    pub fn putpages(&self, file: FileId, req: PutRequest) -> Result<Writeback> {
        let plan = match self.prepare(file, req, None)? {
            Prepared::Finished(outcome) => return Ok(outcome),
            Prepared::Gather(plan) => plan,
        };

        // Inodes of a directory operation must not reach the log before the
        // operation is complete.
        let dirop = self.dirops.is_member(file);
        if dirop {
            debug!(target: "lfs::putpages", event = "dirop_drain", file = file.0);
            self.flush_dirops()?;
        }

        let mode = if plan.flags.sync {
            LockMode::PROTECT_SYNC
        } else {
            LockMode::PROTECT
        };
        let mut restarts = 0_u32;
        loop {
            let mut guard = self.seglock.acquire(mode)?;
            guard.acquire_finfo(file);
            if dirop {
                guard.mark_dirop();
            }

            guard.set_active_file(Some(file));
            let gathered = self.gather(&mut guard, &plan, true)?;
            guard.set_active_file(None);

            if gathered == Gathered::Restart {
                guard.release_finfo();
                guard.release()?;
                restarts += 1;
                self.stats.record_restart();
                debug!(
                    target: "lfs::putpages",
                    event = "restart",
                    file = file.0,
                    restarts
                );
                if restarts > self.config.too_many_retries {
                    warn!(
                        target: "lfs::putpages",
                        event = "restart_looping",
                        file = file.0,
                        restarts
                    );
                }
                continue;
            }

            // Placing data blocks is what dirties their indirect blocks.
            guard.update_meta();
            for level in 1..=NIADDR {
                guard.gather_indirect(file, level)?;
            }
            guard.update_meta();
            guard.release_finfo();
            if guard.write_segment()? > 0 {
                self.stats.record_segment_written();
            }
            guard.release()?;
            break;
        }

        if !plan.file.lock().has_dirty() && self.paging.dequeue(file) {
            trace!(target: "lfs::putpages", event = "paging_clear", file = file.0);
        }
        if plan.flags.sync {
            plan.file.wait_for_output();
        }
        Ok(Writeback::Done)
    }

    /// Write back under a segment lock the caller holds.
    ///
    /// Gathered blocks get their addresses but the partial segment is not
    /// written; that is the caller's job. The caller also owns the file-info
    /// slot for `file`.
    pub fn putpages_locked(
        &self,
        guard: &mut SegmentGuard<'_>,
        file: FileId,
        req: PutRequest,
    ) -> Result<Writeback> {
        let plan = match self.prepare(file, req, Some(&mut **guard))? {
            Prepared::Finished(outcome) => return Ok(outcome),
            Prepared::Gather(plan) => plan,
        };
        guard.set_active_file(Some(file));
        let gathered = self.gather(&mut **guard, &plan, false);
        guard.set_active_file(None);
        let gathered = gathered?;
        guard.update_meta();
        Ok(match gathered {
            Gathered::Full => Writeback::SegmentFull,
            Gathered::Done | Gathered::Restart => Writeback::Done,
        })
    }

    fn prepare(
        &self,
        file: FileId,
        req: PutRequest,
        mut held: Option<&mut Segment>,
    ) -> Result<Prepared> {
        let fc = self.cache.file(file)?;
        let geo = self.geometry;
        let evictor = req.caller == Caller::Evictor;

        let (npages, size) = {
            let state = fc.lock();
            (state.npages(), state.size())
        };
        if npages == 0 {
            if !self.inodes.has_dirty_indirect(file) && self.paging.dequeue(file) {
                trace!(target: "lfs::putpages", event = "paging_clear", file = file.0);
            }
            return Ok(Prepared::Finished(Writeback::Done));
        }

        let blkeof = geo.block_round_up(size);
        let mut start = req.start;
        if !req.flags.sync && !req.flags.reclaim && start >= size && start < blkeof {
            self.activate_tail(&fc, start, blkeof, evictor);
            start = blkeof;
            if req.end > 0 && !req.flags.all_pages && req.end <= start {
                return Ok(Prepared::Finished(Writeback::Done));
            }
        }

        let start = geo.block_round_down(start);
        let end = if req.end == 0 || req.flags.all_pages {
            geo.max_end_offset()
        } else {
            geo.block_round_up(geo.page_round_up(req.end))
        };
        if start >= end {
            trace!(target: "lfs::putpages", event = "empty_range", file = file.0, start);
            return Ok(Prepared::Finished(Writeback::Done));
        }

        if !req.flags.clean {
            let flags = PutFlags {
                clean: false,
                free: req.flags.free,
                busy_fail: evictor,
            };
            let result = fc.put_range(start, end, flags, &mut RefuseWrites)?;
            return Ok(Prepared::Finished(result.into()));
        }

        let reclaim_flags = PutFlags {
            clean: true,
            free: req.flags.free,
            busy_fail: true,
        };
        // The metadata inode is written by checkpoints only.
        if file.is_ifile() {
            let result = fc.put_range(start, end, reclaim_flags, &mut RefuseWrites)?;
            return Ok(Prepared::Finished(result.into()));
        }

        let mode = ClassifyMode {
            seg_locked: held.is_some(),
            evictor,
            first_dirty_only: true,
            suspend_dirty: req.flags.free,
        };
        let mut rounds = 0_u32;
        loop {
            let busy = match check_dirty(&fc, start..end, blkeof, mode, self.config.page_tree_penalty)
            {
                Classification::Dirty(n) if n > 0 => break,
                Classification::Dirty(_) => {
                    match fc.put_range(start, end, reclaim_flags, &mut RefuseWrites)? {
                        PutResult::Busy(page) => page,
                        // Dirtied after the check, or past what the
                        // classifier walks: it needs the segment path.
                        PutResult::Refused(page) => {
                            debug!(
                                target: "lfs::putpages",
                                event = "fast_path_refused",
                                page = %page
                            );
                            break;
                        }
                        result => {
                            self.stats.record_fast_path();
                            debug!(
                                target: "lfs::putpages",
                                event = "clean_fast_path",
                                file = file.0,
                                start,
                                end,
                                free = req.flags.free
                            );
                            return Ok(Prepared::Finished(result.into()));
                        }
                    }
                }
                Classification::HardStop(page) => page,
            };
            if evictor {
                return Ok(Prepared::Finished(Writeback::TryAgain));
            }
            self.wait_busy(held.as_deref_mut(), &fc, busy, Some("dirtyclean"))?;
            rounds += 1;
            if rounds > self.config.too_many_retries {
                warn!(
                    target: "lfs::putpages",
                    event = "dirtyclean_looping",
                    file = file.0,
                    rounds
                );
            }
        }

        // The evictor cannot write the log; the writer daemon does it.
        if evictor {
            if self.paging.enqueue(file) {
                self.writer.notify();
            }
            self.stats.record_deferral();
            debug!(
                target: "lfs::putpages",
                event = "evictor_defer",
                file = file.0,
                start,
                end
            );
            return Ok(Prepared::Finished(Writeback::TryAgain));
        }

        Ok(Prepared::Gather(Plan {
            file: fc,
            start,
            end,
            blkeof,
            flags: req.flags,
        }))
    }

    /// Mark the pages of `[start, blkeof)` active so the evictor leaves the
    /// block holding EOF alone.
    fn activate_tail(&self, fc: &FileCache, start: u64, blkeof: u64, evictor: bool) {
        let geo = self.geometry;
        let mut state = fc.lock();
        let offsets = state.offsets_in(geo.page_round_down(start)..blkeof);
        for off in offsets {
            if state.page(off).is_some_and(Page::is_busy) {
                if evictor {
                    continue;
                }
                fc.wait_for_page(&mut state, off, None);
            }
            if let Some(page) = state.page_mut(off) {
                page.activate();
            }
        }
        trace!(
            target: "lfs::putpages",
            event = "tail_activated",
            file = fc.id().0,
            start,
            blkeof
        );
    }

    /// Wait for a busy page: through the contention breaker when this
    /// thread holds the segment lock, plainly otherwise.
    fn wait_busy(
        &self,
        held: Option<&mut Segment>,
        fc: &FileCache,
        page: PageId,
        label: Option<&str>,
    ) -> Result<()> {
        match held {
            Some(segment) => {
                write_and_wait(
                    segment,
                    fc,
                    page,
                    &self.stats,
                    self.config.too_many_retries,
                    label,
                )?;
            }
            None => {
                let mut state = fc.lock();
                fc.wait_for_page(&mut state, page.offset, label);
            }
        }
        Ok(())
    }

    /// Gather `plan` into `segment` until the range is clean, the segment
    /// fills, or a hard stop calls for a restart.
    fn gather(&self, segment: &mut Segment, plan: &Plan, restart_on_hard_stop: bool) -> Result<Gathered> {
        let mode = ClassifyMode {
            seg_locked: true,
            evictor: false,
            first_dirty_only: false,
            suspend_dirty: plan.flags.free,
        };
        let flags = PutFlags {
            clean: true,
            free: plan.flags.free,
            busy_fail: true,
        };
        let range = plan.start..plan.end;
        let mut rounds = 0_u32;
        let gathered = loop {
            rounds += 1;
            let classified = check_dirty(
                &plan.file,
                range.clone(),
                plan.blkeof,
                mode,
                self.config.page_tree_penalty,
            );
            if let Classification::HardStop(page) = classified {
                self.wait_busy(Some(&mut *segment), &plan.file, page, None)?;
                if restart_on_hard_stop {
                    break Gathered::Restart;
                }
                continue;
            }

            match plan.file.put_range(plan.start, plan.end, flags, &mut *segment)? {
                PutResult::Done => break Gathered::Done,
                PutResult::Full => {
                    assert!(
                        segment.is_single_file(),
                        "shared segment reported full during gather"
                    );
                    debug!(
                        target: "lfs::putpages",
                        event = "segment_full",
                        file = plan.file.id().0,
                        queued = segment.buffer_count()
                    );
                    break Gathered::Full;
                }
                PutResult::Refused(page) => {
                    unreachable!("segment refused block at {page}");
                }
                PutResult::Busy(page) => {
                    if plan.flags.reclaim {
                        std::thread::sleep(self.config.reclaim_backoff);
                    }
                    self.wait_busy(Some(&mut *segment), &plan.file, page, Some("again"))?;
                }
            }
        };
        if rounds > self.config.too_many_retries {
            warn!(
                target: "lfs::putpages",
                event = "gather_looping",
                file = plan.file.id().0,
                rounds
            );
        }
        Ok(gathered)
    }
}
