//! Directory-operation table.
//!
//! A directory operation touches several inodes that must reach the log in
//! the same checkpoint. Files stay members from [`DiropTable::begin`] until
//! a drain writes their inodes out. A writer that needs the members on disk
//! enters with [`DiropTable::writer_enter`]: new operations block, and the
//! writer waits until the in-flight ones end.

use lfs_types::FileId;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Default)]
struct DiropState {
    active: usize,
    writers: usize,
    members: BTreeSet<FileId>,
}

#[derive(Debug, Default)]
pub struct DiropTable {
    state: Mutex<DiropState>,
    cv: Condvar,
}

impl DiropTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a directory operation on `files`, waiting out any writer.
    pub fn begin(&self, files: &[FileId]) {
        let mut state = self.state.lock();
        while state.writers > 0 {
            self.cv.wait(&mut state);
        }
        state.active += 1;
        state.members.extend(files.iter().copied());
    }

    pub fn end(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.active > 0, "dirop end without begin");
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.cv.notify_all();
        }
    }

    #[must_use]
    pub fn is_member(&self, file: FileId) -> bool {
        self.state.lock().members.contains(&file)
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    #[must_use]
    pub fn members(&self) -> Vec<FileId> {
        self.state.lock().members.iter().copied().collect()
    }

    pub fn clear_members(&self, files: &[FileId]) {
        let mut state = self.state.lock();
        for file in files {
            state.members.remove(file);
        }
    }

    /// Block new operations and wait for in-flight ones to end.
    pub fn writer_enter(&self) -> WriterGate<'_> {
        let mut state = self.state.lock();
        state.writers += 1;
        while state.active > 0 {
            debug!(
                target: "lfs::dirop",
                event = "writer_wait",
                active = state.active
            );
            self.cv.wait(&mut state);
        }
        WriterGate { table: self }
    }
}

/// Held while a writer has directory operations blocked.
#[derive(Debug)]
pub struct WriterGate<'a> {
    table: &'a DiropTable,
}

impl Drop for WriterGate<'_> {
    fn drop(&mut self) {
        let mut state = self.table.state.lock();
        state.writers = state.writers.saturating_sub(1);
        if state.writers == 0 {
            self.table.cv.notify_all();
        }
    }
}
