#![forbid(unsafe_code)]
//! End-to-end write-back scenarios against an in-memory log.

use lfs_writeback::{
    Access, FileId, LfsError, Lfs, LockMode, LogicalBlock, MemLogDevice, PutPagesFlags,
    PutRequest, SS_CONT, SS_DIROP, Writeback, WriterDaemon, WritebackConfig,
};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const PAGE: u64 = 4096;
const BLOCK: u64 = 8192;

fn instance(segment_blocks: usize) -> (Lfs, Arc<MemLogDevice>) {
    let config = WritebackConfig {
        segment_blocks,
        ..WritebackConfig::default()
    };
    Lfs::with_memory_log(config, 4096).unwrap()
}

fn dirty_pages(lfs: &Lfs, file: FileId) -> usize {
    lfs.cache()
        .file(file)
        .unwrap()
        .lock()
        .pages()
        .filter(|(_, page)| page.needs_write())
        .count()
}

/// Run `call` on its own thread, failing the test if it never returns.
fn within_deadline<T: Send + 'static>(call: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(call());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("write-back did not return")
}

fn summary_flags(summary: &[u8]) -> u16 {
    u16::from_le_bytes([summary[4], summary[5]])
}

fn clean_flags() -> PutPagesFlags {
    PutPagesFlags {
        clean: true,
        ..PutPagesFlags::default()
    }
}

// ── Round trip ──────────────────────────────────────────────────────────

#[test]
fn sync_writeback_cleans_everything_and_leaves_queue() {
    let (lfs, log) = instance(64);
    let file = FileId(10);
    lfs.create_file(file).unwrap();
    for block in 0..4 {
        lfs.write(file, block * BLOCK + 100, b"payload").unwrap();
    }
    lfs.paging().enqueue(file);
    assert_eq!(dirty_pages(&lfs, file), 4);

    assert_eq!(
        lfs.putpages(file, PutRequest::sync_all()).unwrap(),
        Writeback::Done
    );

    assert_eq!(dirty_pages(&lfs, file), 0);
    assert!(!lfs.paging().contains(file));
    assert_eq!(log.partial_count(), 1);
    assert_eq!(log.block_count(), 4);
    for block in 0..4 {
        assert!(
            lfs.inodes()
                .block_addr(file, LogicalBlock(block))
                .is_some()
        );
    }
    assert_eq!(lfs.cache().file(file).unwrap().lock().num_output(), 0);
    assert_eq!(lfs.read(file, 100, 7).unwrap(), b"payload");
}

#[test]
fn second_call_on_clean_file_touches_no_segment() {
    let (lfs, log) = instance(64);
    let file = FileId(11);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[5_u8; 20_000]).unwrap();
    lfs.putpages(file, PutRequest::sync_all()).unwrap();
    let written = log.partial_count();

    assert_eq!(
        lfs.putpages(file, PutRequest::sync_all()).unwrap(),
        Writeback::Done
    );
    assert_eq!(
        lfs.putpages(file, PutRequest::sync_all()).unwrap(),
        Writeback::Done
    );
    assert_eq!(log.partial_count(), written);
    assert_eq!(lfs.stats().fast_path_reclaims, 2);
}

// ── End of file ─────────────────────────────────────────────────────────

#[test]
fn range_past_eof_in_last_block_only_reactivates() {
    let (lfs, log) = instance(64);
    let file = FileId(12);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[1_u8; 10_000]).unwrap();
    lfs.putpages(file, PutRequest::sync_all()).unwrap();
    let written = log.partial_count();

    let flags = PutPagesFlags {
        clean: true,
        free: true,
        ..PutPagesFlags::default()
    };
    let outcome = lfs
        .putpages(file, PutRequest::range(3 * PAGE, 2 * BLOCK, flags))
        .unwrap();
    assert_eq!(outcome, Writeback::Done);

    let fc = lfs.cache().file(file).unwrap();
    let state = fc.lock();
    assert_eq!(state.npages(), 4);
    assert!(state.page(3 * PAGE).unwrap().is_active());
    drop(state);
    assert_eq!(log.partial_count(), written);
}

#[test]
fn empty_file_is_a_noop() {
    let (lfs, log) = instance(64);
    let file = FileId(13);
    lfs.create_file(file).unwrap();
    lfs.paging().enqueue(file);
    assert_eq!(
        lfs.putpages(file, PutRequest::sync_all()).unwrap(),
        Writeback::Done
    );
    assert!(!lfs.paging().contains(file));
    assert_eq!(log.partial_count(), 0);
}

// ── Evictor ─────────────────────────────────────────────────────────────

#[test]
fn evictor_defers_and_queues_once_per_transition() {
    let (lfs, log) = instance(64);
    let file = FileId(14);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[2_u8; 3 * BLOCK as usize]).unwrap();

    assert_eq!(
        lfs.putpages(file, PutRequest::evict(0, 0)).unwrap(),
        Writeback::TryAgain
    );
    assert_eq!(
        lfs.putpages(file, PutRequest::evict(0, 0)).unwrap(),
        Writeback::TryAgain
    );
    assert_eq!(lfs.paging().snapshot(), vec![file]);
    assert_eq!(lfs.writer_signal().raised(), 1);
    assert_eq!(lfs.stats().evictor_deferrals, 2);
    assert_eq!(log.partial_count(), 0);
    assert!(
        lfs.cache()
            .file(file)
            .unwrap()
            .lock()
            .page(0)
            .unwrap()
            .is_delwri()
    );

    assert_eq!(lfs.flush_paging_queue().unwrap(), 1);
    assert!(lfs.paging().is_empty());
    assert_eq!(dirty_pages(&lfs, file), 0);
    {
        let fc = lfs.cache().file(file).unwrap();
        let state = fc.lock();
        assert!(state.pages().all(|(_, p)| !p.is_wired() && !p.is_busy()));
    }

    // Clean now: the evictor gets its pages back directly.
    assert_eq!(
        lfs.putpages(file, PutRequest::evict(0, 0)).unwrap(),
        Writeback::Done
    );
    assert_eq!(lfs.cache().file(file).unwrap().lock().npages(), 0);

    lfs.write(file, 0, b"again").unwrap();
    assert_eq!(
        lfs.putpages(file, PutRequest::evict(0, 0)).unwrap(),
        Writeback::TryAgain
    );
    assert_eq!(lfs.writer_signal().raised(), 2);
}

#[test]
fn evictor_never_waits_on_a_busy_page() {
    let (lfs, _) = instance(64);
    let file = FileId(15);
    let fc = lfs.create_file(file).unwrap();
    lfs.write(file, 0, b"x").unwrap();
    assert!(fc.try_busy(PAGE, "reader"));

    assert_eq!(
        lfs.putpages(file, PutRequest::evict(0, 0)).unwrap(),
        Writeback::TryAgain
    );
    assert!(lfs.paging().is_empty());
    fc.unbusy(PAGE);
}

#[test]
fn writer_daemon_drains_the_queue() {
    let (lfs, log) = instance(64);
    let lfs = Arc::new(lfs);
    let file = FileId(16);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[7_u8; 2 * BLOCK as usize]).unwrap();

    let daemon = WriterDaemon::spawn(Arc::clone(&lfs)).unwrap();
    assert_eq!(
        lfs.putpages(file, PutRequest::evict(0, 0)).unwrap(),
        Writeback::TryAgain
    );
    for _ in 0..200 {
        if lfs.paging().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    daemon.shutdown();

    assert!(lfs.paging().is_empty());
    assert_eq!(dirty_pages(&lfs, file), 0);
    assert!(log.block_count() >= 2);
    assert!(lfs.stats().daemon_passes >= 1);
}

// ── Reclaim ─────────────────────────────────────────────────────────────

#[test]
fn reclaim_waits_for_busy_page_then_flushes() {
    let (lfs, log) = instance(64);
    let file = FileId(17);
    let fc = lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[9_u8; 3 * BLOCK as usize]).unwrap();
    assert!(fc.try_busy(BLOCK, "reader"));

    let releaser = {
        let fc = Arc::clone(&fc);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            fc.unbusy(BLOCK);
        })
    };

    assert_eq!(
        lfs.putpages(file, PutRequest::reclaim()).unwrap(),
        Writeback::Done
    );
    releaser.join().unwrap();

    assert_eq!(log.block_count(), 3);
    assert_eq!(fc.lock().npages(), 0);
}

#[test]
fn reclaim_backs_off_when_gather_meets_busy_page() {
    let (lfs, log) = instance(64);
    let file = FileId(28);
    let fc = lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[5_u8; BLOCK as usize]).unwrap();
    // Clean pages past end of file: only the gather's reclaim pass sees them.
    let _ = fc.fault(3 * BLOCK, false);
    assert!(fc.try_busy(3 * BLOCK, "reader"));

    let releaser = {
        let fc = Arc::clone(&fc);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            fc.unbusy(3 * BLOCK);
        })
    };
    assert_eq!(
        lfs.putpages(file, PutRequest::reclaim()).unwrap(),
        Writeback::Done
    );
    releaser.join().unwrap();

    let stats = lfs.stats();
    assert_eq!(stats.contention_flushes, 1);
    assert_eq!(stats.restarts, 0);
    assert_eq!(log.block_count(), 1);
    assert_eq!(fc.lock().npages(), 0);
}

// ── Restart after a hard stop ───────────────────────────────────────────

#[test]
fn hard_stop_in_gather_restarts_whole_call() {
    let (lfs, log) = instance(64);
    let file = FileId(29);
    let fc = lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[6_u8; 3 * BLOCK as usize]).unwrap();
    // The fast path stops at block 0; the full pass hard-stops on block 2.
    assert!(fc.try_busy(2 * BLOCK, "reader"));

    let releaser = {
        let fc = Arc::clone(&fc);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            fc.unbusy(2 * BLOCK);
        })
    };
    assert_eq!(
        lfs.putpages(file, PutRequest::sync_all()).unwrap(),
        Writeback::Done
    );
    releaser.join().unwrap();

    assert_eq!(lfs.stats().restarts, 1);
    assert_eq!(log.block_count(), 3);
    assert_eq!(log.partial_count(), 1);
    assert!(!lfs.seglock().is_held());
    assert_eq!(dirty_pages(&lfs, file), 0);
}

// ── Dirty pages past end of file ────────────────────────────────────────

#[test]
fn write_fault_on_empty_file_is_written_back() {
    let (lfs, log) = instance(64);
    let lfs = Arc::new(lfs);
    let file = FileId(30);
    lfs.create_file(file).unwrap();
    let _ = lfs.getpages(file, 0, Access::Write).unwrap();
    assert_eq!(lfs.cache().file(file).unwrap().lock().size(), PAGE);

    let worker = Arc::clone(&lfs);
    let outcome = within_deadline(move || worker.putpages(file, PutRequest::sync_all()));
    assert_eq!(outcome.unwrap(), Writeback::Done);
    assert_eq!(log.block_count(), 1);
    assert_eq!(dirty_pages(&lfs, file), 0);
}

#[test]
fn shrink_drops_dirty_blocks_past_new_end() {
    let (lfs, log) = instance(64);
    let lfs = Arc::new(lfs);
    let file = FileId(31);
    let fc = lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[1_u8; BLOCK as usize]).unwrap();
    lfs.putpages(file, PutRequest::sync_all()).unwrap();
    lfs.write(file, 3 * BLOCK, b"tail").unwrap();

    lfs.set_size(file, 100).unwrap();
    {
        let state = fc.lock();
        assert_eq!(state.npages(), 2);
        assert!(state.page(3 * BLOCK).is_none());
    }

    let worker = Arc::clone(&lfs);
    let outcome = within_deadline(move || worker.putpages(file, PutRequest::sync_all()));
    assert_eq!(outcome.unwrap(), Writeback::Done);
    assert_eq!(log.partial_count(), 1);
    assert_eq!(dirty_pages(&lfs, file), 0);
}

#[test]
fn dirty_block_the_classifier_skips_still_reaches_the_log() {
    let (lfs, log) = instance(64);
    let lfs = Arc::new(lfs);
    let file = FileId(32);
    let fc = lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[2_u8; BLOCK as usize]).unwrap();
    lfs.putpages(file, PutRequest::sync_all()).unwrap();
    let _ = fc.fault(3 * BLOCK, false);
    fc.lock().page_mut(3 * BLOCK).unwrap().mark_dirty();

    assert_eq!(
        lfs.putpages(file, PutRequest::evict(0, 0)).unwrap(),
        Writeback::TryAgain
    );
    assert!(lfs.paging().contains(file));

    let worker = Arc::clone(&lfs);
    let outcome = within_deadline(move || worker.putpages(file, PutRequest::sync_all()));
    assert_eq!(outcome.unwrap(), Writeback::Done);
    assert_eq!(log.block_count(), 2);
    assert_eq!(dirty_pages(&lfs, file), 0);
    assert!(!lfs.paging().contains(file));
}

// ── Segment lock held by the caller ─────────────────────────────────────

#[test]
fn busy_page_in_own_segment_is_flushed_free() {
    let (lfs, log) = instance(64);
    let file = FileId(18);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[4_u8; BLOCK as usize]).unwrap();

    let mut guard = lfs.seglock().acquire(LockMode::PROTECT).unwrap();
    guard.acquire_finfo(file);
    let request = PutRequest::range(0, BLOCK, clean_flags());
    assert_eq!(
        lfs.putpages_locked(&mut guard, file, request).unwrap(),
        Writeback::Done
    );
    assert!(lfs.cache().file(file).unwrap().lock().page(0).unwrap().is_busy());
    assert_eq!(log.partial_count(), 0);

    // The segment itself holds the page; the second pass must flush it.
    assert_eq!(
        lfs.putpages_locked(&mut guard, file, request).unwrap(),
        Writeback::Done
    );
    assert_eq!(lfs.stats().contention_flushes, 1);
    assert_eq!(log.partial_count(), 1);
    guard.release_finfo();
    guard.release().unwrap();
    assert_eq!(dirty_pages(&lfs, file), 0);
}

#[test]
fn single_file_segment_full_stops_without_flushing() {
    let (lfs, log) = instance(3);
    let file = FileId(19);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[6_u8; 4 * BLOCK as usize]).unwrap();

    let mut guard = lfs
        .seglock()
        .acquire(LockMode::PROTECT.single_file())
        .unwrap();
    guard.acquire_finfo(file);
    assert_eq!(
        lfs.putpages_locked(&mut guard, file, PutRequest::writeback())
            .unwrap(),
        Writeback::SegmentFull
    );

    let inodes = lfs.inodes();
    assert!(inodes.block_addr(file, LogicalBlock(0)).is_some());
    assert!(inodes.block_addr(file, LogicalBlock(1)).is_some());
    assert!(inodes.block_addr(file, LogicalBlock(2)).is_none());
    assert_eq!(log.partial_count(), 0);
    assert_eq!(dirty_pages(&lfs, file), 4);

    // The inode record takes the slot the gather left free.
    guard.write_inode(file).unwrap();
    guard.update_meta();
    guard.release_finfo();
    assert_eq!(guard.write_segment().unwrap(), 3);
    guard.release().unwrap();
    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].blocks.len(), 3);
}

#[test]
fn outer_call_under_held_lock_reports_deadlock() {
    let (lfs, _) = instance(64);
    let file = FileId(20);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, b"x").unwrap();

    let guard = lfs.seglock().acquire(LockMode::PROTECT).unwrap();
    let err = lfs.putpages(file, PutRequest::sync_all()).unwrap_err();
    assert!(matches!(err, LfsError::Deadlock(_)));
    drop(guard);
    assert_eq!(
        lfs.putpages(file, PutRequest::sync_all()).unwrap(),
        Writeback::Done
    );
}

// ── Directory operations ────────────────────────────────────────────────

#[test]
fn dirop_file_drains_checkpoint_first() {
    let (lfs, log) = instance(64);
    let file = FileId(21);
    lfs.create_file(file).unwrap();
    lfs.begin_dirop(&[file]);
    lfs.write(file, 0, b"entry").unwrap();
    lfs.end_dirop();

    lfs.putpages(file, PutRequest::sync_all()).unwrap();

    let records = log.records();
    assert_eq!(records.len(), 2);
    assert_eq!(summary_flags(&records[0].summary), SS_DIROP);
    assert_eq!(summary_flags(&records[1].summary), SS_DIROP | SS_CONT);
    assert!(!lfs.dirops().is_member(file));
    assert!(lfs.inodes().get(file).unwrap().inode_addr.is_some());
}

#[test]
fn writer_waits_for_open_dirop() {
    let (lfs, log) = instance(64);
    let lfs = Arc::new(lfs);
    let file = FileId(22);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, b"pending").unwrap();
    lfs.begin_dirop(&[file]);
    lfs.paging().enqueue(file);

    let flusher = Arc::clone(&lfs);
    let handle = std::thread::spawn(move || flusher.flush_paging_queue().unwrap());
    std::thread::sleep(Duration::from_millis(20));
    assert!(!handle.is_finished());
    assert_eq!(log.partial_count(), 0);

    lfs.end_dirop();
    assert_eq!(handle.join().unwrap(), 1);
    assert!(!lfs.dirops().is_member(file));
    assert_eq!(log.partial_count(), 2);
    assert_eq!(dirty_pages(&lfs, file), 0);
}

// ── Other request kinds ─────────────────────────────────────────────────

#[test]
fn invalidation_discards_without_writing() {
    let (lfs, log) = instance(64);
    let file = FileId(23);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[1_u8; 3 * BLOCK as usize]).unwrap();
    assert_eq!(
        lfs.putpages(file, PutRequest::invalidate(0, 0)).unwrap(),
        Writeback::Done
    );
    assert_eq!(lfs.cache().file(file).unwrap().lock().npages(), 0);
    assert_eq!(log.partial_count(), 0);
}

#[test]
fn device_failure_surfaces_and_retry_succeeds() {
    let (lfs, log) = instance(64);
    let file = FileId(24);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[8_u8; 2 * BLOCK as usize]).unwrap();

    log.fail_next_writes(1);
    let err = lfs.putpages(file, PutRequest::sync_all()).unwrap_err();
    assert!(matches!(err, LfsError::Device { .. }));
    assert_eq!(dirty_pages(&lfs, file), 4);
    assert!(!lfs.seglock().is_held());

    assert_eq!(
        lfs.putpages(file, PutRequest::sync_all()).unwrap(),
        Writeback::Done
    );
    assert_eq!(dirty_pages(&lfs, file), 0);
}

#[test]
fn write_fault_is_picked_up_by_writeback() {
    let (lfs, log) = instance(64);
    let file = FileId(25);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, b"abc").unwrap();
    lfs.putpages(file, PutRequest::sync_all()).unwrap();
    let before = log.block_count();

    let _ = lfs.getpages(file, PAGE, Access::Write).unwrap();
    assert!(lfs.inodes().is_modified(file));
    lfs.putpages(file, PutRequest::sync_all()).unwrap();

    assert_eq!(log.block_count(), before + 1);
    let fc = lfs.cache().file(file).unwrap();
    let state = fc.lock();
    assert!(!state.page(PAGE).unwrap().is_modified());
    assert!(!state.page(PAGE).unwrap().is_dirty());
}

#[test]
fn far_block_brings_its_indirect_block_along() {
    let (lfs, log) = instance(64);
    let file = FileId(26);
    lfs.create_file(file).unwrap();
    lfs.write(file, 12 * BLOCK, b"far").unwrap();
    lfs.putpages(file, PutRequest::sync_all()).unwrap();
    assert_eq!(log.block_count(), 2);
    assert!(!lfs.inodes().has_dirty_indirect(file));
}

#[test]
fn shared_segment_spills_into_several_partials() {
    let (lfs, log) = instance(2);
    let file = FileId(27);
    lfs.create_file(file).unwrap();
    lfs.write(file, 0, &[3_u8; 5 * BLOCK as usize]).unwrap();
    lfs.putpages(file, PutRequest::sync_all()).unwrap();
    assert_eq!(log.block_count(), 5);
    assert_eq!(log.partial_count(), 3);
    let addrs: Vec<u64> = (0..5)
        .map(|b| {
            lfs.inodes()
                .block_addr(file, LogicalBlock(b))
                .unwrap()
                .0
        })
        .collect();
    assert!(addrs.windows(2).all(|w| w[0] < w[1]));
}
