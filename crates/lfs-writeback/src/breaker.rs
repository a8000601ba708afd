//! Contention breaker.
//!
//! A thread holding the segment lock can find a page busy because the
//! segment it is building holds it: gathered pages stay busy until the
//! partial segment reaches the device. Waiting would never end. Flushing
//! what has been gathered so far completes those pages and clears the busy
//! flag, so the breaker flushes whenever a data block is queued and then
//! waits.

use crate::stats::WritebackStats;
use lfs_cache::{FileCache, Page};
use lfs_error::Result;
use lfs_segment::Segment;
use lfs_types::PageId;
use parking_lot::MutexGuard;
use tracing::{debug, warn};

/// Write the current partial segment if it holds anything, and open a fresh
/// file-info slot for the same file.
pub(crate) fn flush_partial(segment: &mut Segment, stats: &WritebackStats) -> Result<()> {
    let file = segment.current_finfo().map(|info| info.file);
    segment.update_meta();
    segment.release_finfo();
    segment.write_segment()?;
    stats.record_segment_written();
    if let Some(file) = file {
        segment.acquire_finfo(file);
    }
    Ok(())
}

/// Wait for `page` to come free, flushing the partial segment first
/// whenever it might be the holder.
///
/// Returns the number of flushes it took.
pub(crate) fn write_and_wait(
    segment: &mut Segment,
    file: &FileCache,
    page: PageId,
    stats: &WritebackStats,
    too_many: u32,
    label: Option<&str>,
) -> Result<u32> {
    debug_assert_eq!(page.file, file.id());
    let mut rounds = 0_u32;
    let mut flushes = 0_u32;
    let mut state = file.lock();
    while state.page(page.offset).is_some_and(Page::is_busy) {
        if segment.buffer_count() > 1 {
            MutexGuard::unlocked(&mut state, || flush_partial(segment, stats))?;
            stats.record_contention_flush();
            flushes += 1;
            debug!(
                target: "lfs::putpages",
                event = "contention_flush",
                page = %page,
                log_position = segment.log_position().0
            );
        }
        rounds += 1;
        file.wait_for_page(&mut state, page.offset, label);
    }
    if let Some(label) = label {
        if rounds > too_many {
            warn!(
                target: "lfs::putpages",
                event = "breaker_looping",
                label,
                page = %page,
                rounds
            );
        }
    }
    Ok(flushes)
}
