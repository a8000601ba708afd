//! Paging queue and writer wake-up signal.
//!
//! Files whose dirty pages the evictor could not write itself wait here for
//! the writer daemon. Enqueue and dequeue are presence-checked, so a file is
//! queued at most once however many times the evictor asks.

use lfs_types::FileId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
struct QueueInner {
    order: VecDeque<FileId>,
    members: HashSet<FileId>,
}

#[derive(Debug, Default)]
pub struct PagingQueue {
    inner: Mutex<QueueInner>,
}

impl PagingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `file`. Returns `true` when it was not already queued.
    pub fn enqueue(&self, file: FileId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.insert(file) {
            return false;
        }
        inner.order.push_back(file);
        trace!(target: "lfs::writer", event = "paging_enqueue", file = file.0);
        true
    }

    /// Remove `file`. Returns `true` when it was queued.
    pub fn dequeue(&self, file: FileId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.remove(&file) {
            return false;
        }
        inner.order.retain(|f| *f != file);
        trace!(target: "lfs::writer", event = "paging_dequeue", file = file.0);
        true
    }

    #[must_use]
    pub fn contains(&self, file: FileId) -> bool {
        self.inner.lock().members.contains(&file)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    /// Queued files in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FileId> {
        self.inner.lock().order.iter().copied().collect()
    }
}

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    shutdown: bool,
    raised: u64,
}

/// Wake channel for the writer daemon.
#[derive(Debug, Default)]
pub struct WriterSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

/// Why [`WriterSignal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signalled,
    Timeout,
    Shutdown,
}

impl WriterSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        state.raised += 1;
        self.cv.notify_all();
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }

    /// Times [`notify`](Self::notify) has been called.
    #[must_use]
    pub fn raised(&self) -> u64 {
        self.state.lock().raised
    }

    /// Sleep until notified, shut down, or `timeout` elapses. Consumes a
    /// pending notification.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let mut state = self.state.lock();
        if !state.pending && !state.shutdown {
            let _ = self.cv.wait_for(&mut state, timeout);
        }
        if state.shutdown {
            Wake::Shutdown
        } else if std::mem::take(&mut state.pending) {
            Wake::Signalled
        } else {
            Wake::Timeout
        }
    }
}
