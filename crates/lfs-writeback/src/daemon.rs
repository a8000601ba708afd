//! Writer daemon.
//!
//! The evictor only queues files; this thread writes them. Each pass first
//! checkpoints pending directory operations, then takes the segment lock
//! once and runs the nested coordinator over every queued file.

use crate::paging::Wake;
use crate::putpages::{PutRequest, Writeback};
use crate::Lfs;
use lfs_error::Result;
use lfs_segment::{LockMode, SegmentGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

impl Lfs {
    /// Write the inodes of every file touched by a finished directory
    /// operation in one checkpoint segment.
    ///
    /// New directory operations are held off until it returns. Returns the
    /// number of inodes written.
    pub fn flush_dirops(&self) -> Result<usize> {
        if self.is_read_only() {
            return Ok(0);
        }
        let gate = self.dirops.writer_enter();
        let files = self.dirops.members();
        if files.is_empty() {
            return Ok(0);
        }

        let mut guard = self.seglock.acquire(LockMode::CHECKPOINT)?;
        guard.mark_dirop();
        for file in &files {
            debug_assert!(!file.is_ifile());
            guard.write_inode(*file)?;
        }
        guard.end_dirop();
        guard.update_meta();
        self.write_out(&mut guard)?;
        guard.release()?;

        self.dirops.clear_members(&files);
        drop(gate);
        debug!(
            target: "lfs::dirop",
            event = "dirops_flushed",
            inodes = files.len()
        );
        Ok(files.len())
    }

    /// Write back every file on the paging queue.
    ///
    /// Files still inside a directory operation and the metadata inode are
    /// skipped. A full segment is written and ends the pass; whatever is
    /// left stays queued. Returns the number of files dequeued.
    pub fn flush_paging_queue(&self) -> Result<usize> {
        if self.is_read_only() || self.paging.is_empty() {
            return Ok(0);
        }
        self.flush_dirops()?;
        self.stats.record_daemon_pass();

        let mut guard = self.seglock.acquire(LockMode::PROTECT.single_file())?;
        let mut cleared = 0;
        for file in self.paging.snapshot() {
            if file.is_ifile() || self.dirops.is_member(file) {
                continue;
            }
            let Ok(fc) = self.cache.file(file) else {
                self.paging.dequeue(file);
                continue;
            };

            guard.acquire_finfo(file);
            let outcome = self.putpages_locked(&mut guard, file, PutRequest::writeback())?;
            guard.write_inode(file)?;
            guard.update_meta();
            guard.release_finfo();

            if !fc.lock().has_dirty() && self.paging.dequeue(file) {
                cleared += 1;
            }
            if outcome == Writeback::SegmentFull {
                debug!(
                    target: "lfs::writer",
                    event = "segment_full",
                    file = file.0,
                    remaining = self.paging.len()
                );
                break;
            }
        }
        self.write_out(&mut guard)?;
        guard.release()?;
        Ok(cleared)
    }

    fn write_out(&self, guard: &mut SegmentGuard<'_>) -> Result<()> {
        if guard.write_segment()? > 0 {
            self.stats.record_segment_written();
        }
        Ok(())
    }

    fn writer_loop(&self) {
        info!(target: "lfs::writer", event = "writer_start");
        loop {
            match self.writer.wait(self.config.writer_interval) {
                Wake::Shutdown => break,
                Wake::Signalled | Wake::Timeout => {}
            }
            if let Err(err) = self.flush_paging_queue() {
                warn!(
                    target: "lfs::writer",
                    event = "writer_flush_failed",
                    error = %err
                );
            }
        }
        info!(target: "lfs::writer", event = "writer_stop");
    }
}

/// Handle to the writer thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct WriterDaemon {
    lfs: Arc<Lfs>,
    handle: Option<JoinHandle<()>>,
}

impl WriterDaemon {
    pub fn spawn(lfs: Arc<Lfs>) -> Result<Self> {
        let worker = Arc::clone(&lfs);
        let handle = thread::Builder::new()
            .name("lfs_writer".to_owned())
            .spawn(move || worker.writer_loop())?;
        Ok(Self {
            lfs,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.lfs.writer.shutdown();
            if handle.join().is_err() {
                warn!(target: "lfs::writer", event = "writer_panicked");
            }
        }
    }
}

impl Drop for WriterDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
