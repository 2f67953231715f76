//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk sectors keyed by
//! `(device, LBA)`. Caching sectors in memory reduces the number of disk
//! reads and also provides a synchronization point for sectors used by
//! multiple processes.
//!
//! Interface:
//! * To get a pinned, locked buffer for a particular sector, call `get`.
//! * After changing buffer data, call `mark_dirty`.
//! * Dropping the `Buf` releases the lock and the pin.
//! * Dirty buffers reach the disk on `sync`, on eviction, or when a
//!   filesystem asks for a flush.
//!
//! A buffer with a non-zero pin count is never evicted; a dirty buffer is
//! written back before eviction; the per-entry sleep lock admits at most
//! one driver I/O per buffer at a time.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::device::{self, DeviceId};
use crate::error::{KernelError, Result};
use crate::lock::{SleepLock, SpinLock};
use crate::param::{NBIOBUCKET, NBUF};

pub struct BufEntry {
    dev: DeviceId,
    lba: u32,
    inner: SleepLock<BufInner>,
}

struct BufInner {
    /// Has data been read from disk?
    valid: bool,

    /// Does the cached copy differ from the disk?
    dirty: bool,

    data: Vec<u8>,
}

impl BufEntry {
    fn new(dev: DeviceId, lba: u32, sector_size: usize) -> Self {
        Self {
            dev,
            lba,
            inner: SleepLock::new(
                "buffer",
                BufInner {
                    valid: false,
                    dirty: false,
                    data: alloc::vec![0; sector_size],
                },
            ),
        }
    }
}

/// A pinned, locked buffer. The pin is the `Arc`; the lock is held for
/// the lifetime of the value.
pub struct Buf {
    entry: Arc<BufEntry>,
}

impl Buf {
    /// Acquires the entry's lock and wraps it. The guard is leaked and
    /// reconstructed in `drop`, which keeps `Buf` free of borrows.
    fn lock(entry: Arc<BufEntry>) -> Self {
        mem::forget(entry.inner.lock());
        Self { entry }
    }

    fn inner(&self) -> &BufInner {
        // SAFETY: the lock is held for as long as `self` lives.
        unsafe { &*self.entry.inner.get_mut_raw() }
    }

    fn inner_mut(&mut self) -> &mut BufInner {
        // SAFETY: the lock is held and `&mut self` is exclusive.
        unsafe { &mut *self.entry.inner.get_mut_raw() }
    }

    pub fn dev(&self) -> DeviceId {
        self.entry.dev
    }

    pub fn lba(&self) -> u32 {
        self.entry.lba
    }

    pub fn data(&self) -> &[u8] {
        &self.inner().data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.inner_mut().data
    }

    /// Records that the cached copy is newer than the disk.
    pub fn mark_dirty(&mut self) {
        self.inner_mut().dirty = true;
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // SAFETY: `lock` acquired the lock and forgot the guard.
        unsafe { self.entry.inner.unlock() };
    }
}

struct Bucket {
    entries: Vec<Arc<BufEntry>>,
}

/// Sector cache over the registered block devices.
pub struct Bcache {
    buckets: Vec<SpinLock<Bucket>>,
    /// Resident entries across all buckets.
    count: AtomicUsize,
}

impl Bcache {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NBIOBUCKET);
        for _ in 0..NBIOBUCKET {
            buckets.push(SpinLock::new("bio bucket", Bucket { entries: Vec::new() }));
        }
        Self {
            buckets,
            count: AtomicUsize::new(0),
        }
    }

    fn bucket_of(&self, dev: DeviceId, lba: u32) -> &SpinLock<Bucket> {
        let h = (dev as usize).wrapping_mul(31).wrapping_add(lba as usize);
        &self.buckets[h % NBIOBUCKET]
    }

    /// Returns a pinned, locked buffer whose contents reflect the on-disk
    /// sector. If the sector was not cached, it is read here; a read
    /// failure discards the entry instead of caching it.
    pub fn get(&self, dev: DeviceId, lba: u32) -> Result<Buf> {
        let device = device::by_id(dev)?;
        let bucket = self.bucket_of(dev, lba);

        let entry = {
            let mut guard = bucket.lock();
            match guard.entries.iter().find(|e| e.dev == dev && e.lba == lba) {
                Some(e) => e.clone(),
                None => {
                    if self.count.load(Ordering::Relaxed) >= NBUF {
                        self.evict_from(&mut guard);
                    }
                    let e = Arc::new(BufEntry::new(dev, lba, device.sector_size()));
                    guard.entries.push(e.clone());
                    let _ = self.count.fetch_add(1, Ordering::Relaxed);
                    e
                }
            }
        };

        let mut buf = Buf::lock(entry);
        if !buf.inner().valid {
            if let Err(e) = device.read_sector(lba, buf.data_mut()) {
                drop(buf);
                let mut guard = bucket.lock();
                if let Some(pos) = guard
                    .entries
                    .iter()
                    .position(|x| x.dev == dev && x.lba == lba)
                {
                    let _ = guard.entries.remove(pos);
                    let _ = self.count.fetch_sub(1, Ordering::Relaxed);
                }
                return Err(e);
            }
            buf.inner_mut().valid = true;
        }
        Ok(buf)
    }

    /// Like `get`, but skips the disk read and hands back a zeroed,
    /// dirty-to-be buffer. For freshly allocated sectors whose on-disk
    /// contents are garbage.
    pub fn get_clear(&self, dev: DeviceId, lba: u32) -> Result<Buf> {
        let device = device::by_id(dev)?;
        let bucket = self.bucket_of(dev, lba);

        let entry = {
            let mut guard = bucket.lock();
            match guard.entries.iter().find(|e| e.dev == dev && e.lba == lba) {
                Some(e) => e.clone(),
                None => {
                    if self.count.load(Ordering::Relaxed) >= NBUF {
                        self.evict_from(&mut guard);
                    }
                    let e = Arc::new(BufEntry::new(dev, lba, device.sector_size()));
                    guard.entries.push(e.clone());
                    let _ = self.count.fetch_add(1, Ordering::Relaxed);
                    e
                }
            }
        };

        let mut buf = Buf::lock(entry);
        buf.data_mut().fill(0);
        buf.inner_mut().valid = true;
        Ok(buf)
    }

    /// Drops one unpinned entry from `bucket`, writing it back first if
    /// dirty. Quietly does nothing when every entry is pinned; the cache
    /// then runs soft-over its configured size.
    fn evict_from(&self, bucket: &mut Bucket) {
        let mut victim = None;
        for (pos, entry) in bucket.entries.iter().enumerate() {
            // Unpinned means the table holds the only reference, so the
            // sleep lock below cannot block.
            if Arc::strong_count(entry) != 1 {
                continue;
            }
            if !entry.inner.raw().try_acquire() {
                continue;
            }
            // SAFETY: try_acquire succeeded; released below.
            let inner = unsafe { &mut *entry.inner.get_mut_raw() };
            let mut ok = true;
            if inner.dirty {
                ok = self
                    .writeback_locked(entry.dev, entry.lba, inner)
                    .is_ok();
            }
            // SAFETY: acquired above.
            unsafe { entry.inner.unlock() };
            if ok {
                victim = Some(pos);
                break;
            }
        }
        if let Some(pos) = victim {
            let _ = bucket.entries.remove(pos);
            let _ = self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn writeback_locked(&self, dev: DeviceId, lba: u32, inner: &mut BufInner) -> Result<()> {
        let device = device::by_id(dev)?;
        device.write_sector(lba, &inner.data)?;
        inner.dirty = false;
        Ok(())
    }

    /// Writes every dirty buffer back, for one device or all of them.
    /// Returns the number of buffers written. Write failures leave the
    /// dirty bit set for a later sync.
    pub fn sync(&self, dev: Option<DeviceId>) -> Result<usize> {
        let mut written = 0;
        let mut first_err = None;
        for bucket in &self.buckets {
            let entries: Vec<Arc<BufEntry>> = bucket
                .lock()
                .entries
                .iter()
                .filter(|e| dev.map_or(true, |d| e.dev == d))
                .cloned()
                .collect();
            for entry in entries {
                let mut buf = Buf::lock(entry);
                if buf.inner().dirty {
                    let (dev, lba) = (buf.dev(), buf.lba());
                    match self.writeback_locked(dev, lba, buf.inner_mut()) {
                        Ok(()) => written += 1,
                        Err(e) => first_err = Some(e),
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Resident entry count, for diagnostics.
    pub fn resident(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Bcache {
    fn default() -> Self {
        Self::new()
    }
}
