//! Log devices that partial segments are appended to.

use lfs_error::{LfsError, Result};
use lfs_types::DiskAddr;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Block-addressed append target for partial segments.
pub trait LogDevice: Send + Sync + fmt::Debug {
    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of addressable blocks.
    fn capacity_blocks(&self) -> u64;

    /// Write one partial segment: the summary block at `addr`, followed by
    /// `blocks` at consecutive addresses.
    fn write_partial(&self, addr: DiskAddr, summary: &[u8], blocks: &[&[u8]]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_extent(device: &dyn LogDevice, addr: DiskAddr, nblocks: usize) -> Result<()> {
    let end = addr
        .0
        .checked_add(1)
        .and_then(|v| v.checked_add(nblocks as u64))
        .ok_or(LfsError::NoSpace)?;
    if end > device.capacity_blocks() {
        return Err(LfsError::NoSpace);
    }
    Ok(())
}

/// One partial segment as seen by a [`MemLogDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRecord {
    pub addr: DiskAddr,
    pub summary: Vec<u8>,
    pub blocks: Vec<Vec<u8>>,
}

/// In-memory log that keeps every partial segment it receives.
#[derive(Debug)]
pub struct MemLogDevice {
    block_size: u32,
    capacity: u64,
    records: Mutex<Vec<PartialRecord>>,
    fail_writes: AtomicUsize,
    syncs: AtomicUsize,
}

impl MemLogDevice {
    #[must_use]
    pub fn new(block_size: u32, capacity_blocks: u64) -> Self {
        Self {
            block_size,
            capacity: capacity_blocks,
            records: Mutex::new(Vec::new()),
            fail_writes: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn records(&self) -> Vec<PartialRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn partial_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Data blocks written across all partial segments.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.records.lock().iter().map(|r| r.blocks.len()).sum()
    }

    #[must_use]
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Make the next `n` partial-segment writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }
}

impl LogDevice for MemLogDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn capacity_blocks(&self) -> u64 {
        self.capacity
    }

    fn write_partial(&self, addr: DiskAddr, summary: &[u8], blocks: &[&[u8]]) -> Result<()> {
        check_extent(self, addr, blocks.len())?;
        let armed = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(LfsError::Device {
                addr: addr.0,
                detail: "injected write failure".to_owned(),
            });
        }
        self.records.lock().push(PartialRecord {
            addr,
            summary: summary.to_vec(),
            blocks: blocks.iter().map(|b| b.to_vec()).collect(),
        });
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// File-backed log using positional writes.
///
/// `FileExt::write_all_at` is thread-safe and needs no shared seek position.
#[derive(Debug, Clone)]
pub struct FileLogDevice {
    file: Arc<File>,
    block_size: u32,
    capacity: u64,
}

impl FileLogDevice {
    /// Open (creating if needed) a log file sized to `capacity_blocks`.
    pub fn open(path: impl AsRef<Path>, block_size: u32, capacity_blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = capacity_blocks
            .checked_mul(u64::from(block_size))
            .ok_or_else(|| LfsError::InvalidGeometry("log length overflows u64".to_owned()))?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(Self {
            file: Arc::new(file),
            block_size,
            capacity: capacity_blocks,
        })
    }

    fn write_block_at(&self, addr: u64, data: &[u8]) -> Result<()> {
        let block_size = usize::try_from(self.block_size)
            .map_err(|_| LfsError::InvalidGeometry("block_size does not fit usize".to_owned()))?;
        if data.len() > block_size {
            return Err(LfsError::Device {
                addr,
                detail: format!("block payload too large: got={} max={block_size}", data.len()),
            });
        }
        let offset = addr
            .checked_mul(u64::from(self.block_size))
            .ok_or(LfsError::NoSpace)?;
        let mut buf = vec![0_u8; block_size];
        buf[..data.len()].copy_from_slice(data);
        self.file.write_all_at(&buf, offset)?;
        Ok(())
    }
}

impl LogDevice for FileLogDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn capacity_blocks(&self) -> u64 {
        self.capacity
    }

    fn write_partial(&self, addr: DiskAddr, summary: &[u8], blocks: &[&[u8]]) -> Result<()> {
        check_extent(self, addr, blocks.len())?;
        self.write_block_at(addr.0, summary)?;
        for (i, block) in blocks.iter().enumerate() {
            self.write_block_at(addr.0 + 1 + i as u64, block)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
