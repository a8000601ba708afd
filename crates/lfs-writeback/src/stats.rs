//! Write-back counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for the coordinator and the writer daemon.
#[derive(Default)]
pub struct WritebackStats {
    fast_path_reclaims: AtomicU64,
    evictor_deferrals: AtomicU64,
    restarts: AtomicU64,
    contention_flushes: AtomicU64,
    segments_written: AtomicU64,
    daemon_passes: AtomicU64,
}

impl WritebackStats {
    pub(crate) fn record_fast_path(&self) {
        self.fast_path_reclaims.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferral(&self) {
        self.evictor_deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_contention_flush(&self) {
        self.contention_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_written(&self) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_daemon_pass(&self) {
        self.daemon_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fast_path_reclaims: self.fast_path_reclaims.load(Ordering::Relaxed),
            evictor_deferrals: self.evictor_deferrals.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            contention_flushes: self.contention_flushes.load(Ordering::Relaxed),
            segments_written: self.segments_written.load(Ordering::Relaxed),
            daemon_passes: self.daemon_passes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for WritebackStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("WritebackStats")
            .field("fast_path_reclaims", &s.fast_path_reclaims)
            .field("evictor_deferrals", &s.evictor_deferrals)
            .field("restarts", &s.restarts)
            .field("contention_flushes", &s.contention_flushes)
            .field("segments_written", &s.segments_written)
            .field("daemon_passes", &s.daemon_passes)
            .finish()
    }
}

/// Point-in-time copy of [`WritebackStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Clean ranges handed straight to the cache reclaimer.
    pub fast_path_reclaims: u64,
    /// Evictor requests turned into a paging-queue entry.
    pub evictor_deferrals: u64,
    /// Coordinator passes that dropped the segment lock and started over.
    pub restarts: u64,
    /// Partial segments flushed to free a page the segment itself held.
    pub contention_flushes: u64,
    /// Partial segments written by the coordinator and the writer daemon.
    pub segments_written: u64,
    pub daemon_passes: u64,
}
