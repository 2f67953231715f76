//! Block device registry.
//!
//! The transports themselves (ATA PIO, ramdisks) are collaborators; the
//! core sees them as sector-granular `BlockDevice` implementations
//! registered here under a name and a small integer id that the caches
//! and the mount table key on.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::lock::SpinLock;
use crate::param::SECTOR_SIZE;

pub type DeviceId = u32;

pub trait BlockDevice: Send + Sync {
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn nsectors(&self) -> u32;

    /// Reads the sector at `lba`; `buf` is exactly one sector.
    fn read_sector(&self, lba: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes the sector at `lba`.
    fn write_sector(&self, lba: u32, buf: &[u8]) -> Result<()>;
}

struct Registered {
    id: DeviceId,
    name: &'static str,
    dev: Arc<dyn BlockDevice>,
}

static DEVICES: SpinLock<Vec<Registered>> = SpinLock::new("devices", Vec::new());

/// Registers a device and returns its id. Ids are never reused.
pub fn register(name: &'static str, dev: Arc<dyn BlockDevice>) -> DeviceId {
    let mut table = DEVICES.lock();
    let id = table.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    table.push(Registered { id, name, dev });
    id
}

pub fn by_id(id: DeviceId) -> Result<Arc<dyn BlockDevice>> {
    DEVICES
        .lock()
        .iter()
        .find(|r| r.id == id)
        .map(|r| r.dev.clone())
        .ok_or(KernelError::NotFound)
}

pub fn by_name(name: &str) -> Result<(DeviceId, Arc<dyn BlockDevice>)> {
    DEVICES
        .lock()
        .iter()
        .find(|r| r.name == name)
        .map(|r| (r.id, r.dev.clone()))
        .ok_or(KernelError::NotFound)
}

/// RAM-backed device double for unit tests, with fault injection and
/// I/O counters.
#[cfg(test)]
pub mod test_dev {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    pub struct MemDisk {
        sectors: Mutex<Vec<u8>>,
        pub reads: AtomicU64,
        pub writes: AtomicU64,
        pub fail_reads: AtomicBool,
        pub fail_writes: AtomicBool,
    }

    impl MemDisk {
        pub fn new(nsectors: u32) -> Self {
            Self {
                sectors: Mutex::new(vec![0u8; nsectors as usize * SECTOR_SIZE]),
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    impl BlockDevice for MemDisk {
        fn nsectors(&self) -> u32 {
            (self.sectors.lock().unwrap().len() / SECTOR_SIZE) as u32
        }

        fn read_sector(&self, lba: u32, buf: &mut [u8]) -> Result<()> {
            if self.fail_reads.load(Ordering::Relaxed) {
                return Err(KernelError::Io);
            }
            let _ = self.reads.fetch_add(1, Ordering::Relaxed);
            let data = self.sectors.lock().unwrap();
            let off = lba as usize * SECTOR_SIZE;
            buf.copy_from_slice(&data[off..off + SECTOR_SIZE]);
            Ok(())
        }

        fn write_sector(&self, lba: u32, buf: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(KernelError::Io);
            }
            let _ = self.writes.fetch_add(1, Ordering::Relaxed);
            let mut data = self.sectors.lock().unwrap();
            let off = lba as usize * SECTOR_SIZE;
            data[off..off + SECTOR_SIZE].copy_from_slice(buf);
            Ok(())
        }
    }
}
