//! Filesystem-wide segment lock.
//!
//! One thread at a time builds and flushes the active [`Segment`]. Holding a
//! [`SegmentGuard`] is the proof that the caller owns the segment; routines
//! that must run under the lock take `&mut SegmentGuard` instead of a
//! "locked" flag. Re-acquiring from the holding thread is reported as
//! [`LfsError::Deadlock`] rather than hanging.

use crate::segment::Segment;
use lfs_error::{LfsError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

/// How the lock is being taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockMode {
    /// Sync the log device when the lock is released.
    pub sync: bool,
    /// Checkpoint: the written state is self-consistent. Implies a sync.
    pub checkpoint: bool,
    /// Restrict the segment to one file; a full segment is reported
    /// instead of flushed.
    pub single_file: bool,
}

impl LockMode {
    pub const PROTECT: Self = Self {
        sync: false,
        checkpoint: false,
        single_file: false,
    };

    pub const PROTECT_SYNC: Self = Self {
        sync: true,
        checkpoint: false,
        single_file: false,
    };

    pub const CHECKPOINT: Self = Self {
        sync: true,
        checkpoint: true,
        single_file: false,
    };

    #[must_use]
    pub fn single_file(self) -> Self {
        Self {
            single_file: true,
            ..self
        }
    }
}

#[derive(Debug)]
pub struct SegmentLock {
    segment: Mutex<Segment>,
    holder: Mutex<Option<ThreadId>>,
    acquisitions: AtomicU64,
}

impl SegmentLock {
    #[must_use]
    pub fn new(segment: Segment) -> Self {
        Self {
            segment: Mutex::new(segment),
            holder: Mutex::new(None),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Take the lock, blocking while another thread holds it.
    pub fn acquire(&self, mode: LockMode) -> Result<SegmentGuard<'_>> {
        let me = thread::current().id();
        if *self.holder.lock() == Some(me) {
            return Err(LfsError::Deadlock(
                "segment lock already held by this thread".to_owned(),
            ));
        }
        let mut segment = self.segment.lock();
        *self.holder.lock() = Some(me);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        segment.set_single_file(mode.single_file);
        trace!(
            target: "lfs::segment",
            event = "seglock_acquire",
            sync = mode.sync,
            checkpoint = mode.checkpoint,
            single_file = mode.single_file
        );
        Ok(SegmentGuard {
            lock: self,
            segment,
            mode,
        })
    }

    /// Whether any thread holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }

    #[must_use]
    pub fn held_by_current(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }

    /// Total successful acquisitions since creation.
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// Exclusive access to the active segment.
///
/// Blocks still queued when the guard goes away are written out first so
/// their pages do not stay busy.
#[derive(Debug)]
pub struct SegmentGuard<'a> {
    lock: &'a SegmentLock,
    segment: MutexGuard<'a, Segment>,
    mode: LockMode,
}

impl SegmentGuard<'_> {
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the lock, flushing leftovers and syncing the device when the
    /// lock was taken in sync or checkpoint mode.
    pub fn release(mut self) -> Result<()> {
        self.flush_leftovers()?;
        if self.mode.sync || self.mode.checkpoint {
            self.segment.device().sync()?;
        }
        debug!(
            target: "lfs::segment",
            event = "seglock_release",
            synced = self.mode.sync || self.mode.checkpoint,
            log_position = self.segment.log_position().0
        );
        Ok(())
    }

    fn flush_leftovers(&mut self) -> Result<()> {
        if !self.segment.has_pending() {
            return Ok(());
        }
        self.segment.release_finfo();
        self.segment.update_meta();
        self.segment.write_segment()?;
        Ok(())
    }
}

impl Deref for SegmentGuard<'_> {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl DerefMut for SegmentGuard<'_> {
    fn deref_mut(&mut self) -> &mut Segment {
        &mut self.segment
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.flush_leftovers() {
            warn!(
                target: "lfs::segment",
                event = "seglock_drop_flush_failed",
                error = %err
            );
        }
        self.segment.set_active_file(None);
        *self.lock.holder.lock() = None;
    }
}
