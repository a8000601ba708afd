//! Cached page record.

/// Reservation state of a page.
///
/// A busy page may not be inspected or modified by anyone but the holder.
/// Waiting for `Free` is done on the owning file's condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusyState {
    Free,
    Busy,
}

/// One page of cached file content and its state bits.
///
/// Invariant: all mutation happens under the owning file's lock.
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
    busy: BusyState,
    owner: Option<&'static str>,
    /// Software dirty flag (the page is not known clean).
    dirty: bool,
    /// Hardware-modified bit set by stores through a writable mapping.
    modified: bool,
    mapped: bool,
    wire_count: u32,
    /// Write suspended: wired for write-back so the evictor skips it.
    delwri: bool,
    active: bool,
}

impl Page {
    #[must_use]
    pub fn zeroed(page_size: u64) -> Self {
        Self {
            data: vec![0_u8; usize::try_from(page_size).unwrap_or(0)],
            busy: BusyState::Free,
            owner: None,
            dirty: false,
            modified: false,
            mapped: false,
            wire_count: 0,
            delwri: false,
            active: false,
        }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy == BusyState::Busy
    }

    /// Tag of the current busy holder, for diagnostics.
    #[must_use]
    pub fn owner(&self) -> Option<&'static str> {
        self.owner
    }

    pub fn set_busy(&mut self, owner: &'static str) {
        debug_assert!(!self.is_busy(), "page already busy (owner {:?})", self.owner);
        self.busy = BusyState::Busy;
        self.owner = Some(owner);
    }

    pub fn clear_busy(&mut self) {
        self.busy = BusyState::Free;
        self.owner = None;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Dirty by either the software flag or the hardware-modified bit.
    #[must_use]
    pub fn needs_write(&self) -> bool {
        self.dirty || self.modified
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Record a store through a writable mapping.
    pub fn set_modified(&mut self) {
        self.modified = true;
    }

    /// Read and clear the hardware-modified bit.
    pub fn clear_modify(&mut self) -> bool {
        std::mem::replace(&mut self.modified, false)
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn map(&mut self) {
        self.mapped = true;
    }

    /// Remove the page from every address space that maps it.
    pub fn unmap(&mut self) {
        self.mapped = false;
    }

    #[must_use]
    pub fn is_wired(&self) -> bool {
        self.wire_count > 0
    }

    #[must_use]
    pub fn wire_count(&self) -> u32 {
        self.wire_count
    }

    pub fn wire(&mut self) {
        self.wire_count = self.wire_count.saturating_add(1);
    }

    pub fn unwire(&mut self) {
        self.wire_count = self.wire_count.saturating_sub(1);
    }

    #[must_use]
    pub fn is_delwri(&self) -> bool {
        self.delwri
    }

    /// Wire the page and flag its write as suspended. Idempotent.
    pub fn suspend_write(&mut self) {
        if !self.delwri {
            self.wire();
            self.delwri = true;
        }
    }

    /// Undo [`suspend_write`](Self::suspend_write) once the write is done.
    pub fn resume_write(&mut self) {
        if self.delwri {
            self.unwire();
            self.delwri = false;
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Move the page to the active queue so the evictor leaves it alone.
    pub fn activate(&mut self) {
        self.active = true;
    }
}
