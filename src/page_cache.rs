//! Page cache.
//!
//! A fixed-width hash of file pages keyed by `(device, inode, page
//! index)`, chained per bucket, with a doubly-linked LRU whose head is
//! the most recently used entry. Entries, chain links, and LRU links all
//! live in one arena of slots; links are indices, never pointers.
//!
//! One cache-wide spinlock protects the hash, the LRU, the statistics,
//! and the page count. Each entry additionally carries a cooperative
//! `LOCKED` bit taken around I/O and partial-page write framing; waiting
//! for it yields the scheduler. The ordering is always cache lock, then
//! entry lock, and an entry's reference count is raised under the cache
//! lock before the lock is dropped, which is what makes the entry safe
//! to touch afterwards.
//!
//! Backing I/O goes through the `PageIo` interface, which the VFS
//! implements by routing to the owning driver's inode read/write.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::device::DeviceId;
use crate::error::{KernelError, Result};
use crate::kalloc::PhysPages;
use crate::lock::SpinLock;
use crate::param::{NBUCKET, PGSIZE};
use crate::proc::scheduler;

bitflags! {
    pub struct PageFlags: u32 {
        /// The entry holds data for its key.
        const VALID = 0x01;
        /// The cached copy is newer than the backing store.
        const DIRTY = 0x02;
        /// Cooperative exclusive lock for I/O and write framing.
        const LOCKED = 0x04;
        /// The whole page mirrors the backing store.
        const UPTODATE = 0x08;
        /// The last backing I/O on this page failed.
        const ERROR = 0x10;
    }
}

/// Identity of one cached file page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageKey {
    pub dev: DeviceId,
    pub inum: u32,
    pub index: u32,
}

impl PageKey {
    pub fn new(dev: DeviceId, inum: u32, index: u32) -> Self {
        Self { dev, inum, index }
    }

    fn bucket(&self) -> usize {
        let h = (self.dev as usize)
            .wrapping_mul(31)
            .wrapping_add((self.inum as usize).wrapping_mul(7))
            .wrapping_add(self.index as usize);
        h % NBUCKET
    }

    fn byte_offset(&self) -> u64 {
        self.index as u64 * PGSIZE as u64
    }
}

/// Reference to a resident entry. Holders own one unit of the entry's
/// reference count and must `put` it back.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageId(u32);

const NIL: u32 = u32::MAX;

struct PageEntry {
    key: PageKey,
    frame: PhysPages,
    flags: PageFlags,
    refcnt: u32,
    /// User mappings of this page (kept for the mmap-style paths).
    mapcnt: u32,
    hash_next: u32,
    hash_prev: u32,
    lru_next: u32,
    lru_prev: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

/// What the cache needs from the layer below it.
pub trait PageIo: Send + Sync {
    /// Reads file bytes at `off`; short reads zero-fill nothing (the
    /// cache handles the tail). Returns bytes read.
    fn read_inode(&self, dev: DeviceId, inum: u32, off: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes file bytes at `off`. Returns bytes written.
    fn write_inode(&self, dev: DeviceId, inum: u32, off: u64, buf: &[u8]) -> Result<usize>;

    /// Current byte size of the file, used to clamp writeback.
    fn stat_inode(&self, dev: DeviceId, inum: u32) -> Result<u64>;
}

struct PcInner {
    slots: Vec<Option<Box<PageEntry>>>,
    free: Vec<u32>,
    hash: [u32; NBUCKET],
    /// Most recently used.
    lru_head: u32,
    lru_tail: u32,
    npages: usize,
    stats: PageCacheStats,
}

pub struct PageCache {
    max_pages: usize,
    backing: Arc<dyn PageIo>,
    inner: SpinLock<PcInner>,
}

impl PcInner {
    fn e(&self, i: u32) -> &PageEntry {
        self.slots[i as usize].as_deref().expect("stale page index")
    }

    fn em(&mut self, i: u32) -> &mut PageEntry {
        self.slots[i as usize].as_deref_mut().expect("stale page index")
    }

    fn hash_insert(&mut self, i: u32) {
        let b = self.e(i).key.bucket();
        let head = self.hash[b];
        self.em(i).hash_next = head;
        self.em(i).hash_prev = NIL;
        if head != NIL {
            self.em(head).hash_prev = i;
        }
        self.hash[b] = i;
    }

    fn hash_remove(&mut self, i: u32) {
        let (b, prev, next) = {
            let e = self.e(i);
            (e.key.bucket(), e.hash_prev, e.hash_next)
        };
        if prev != NIL {
            self.em(prev).hash_next = next;
        } else {
            self.hash[b] = next;
        }
        if next != NIL {
            self.em(next).hash_prev = prev;
        }
    }

    fn hash_find(&self, key: &PageKey) -> Option<u32> {
        let mut i = self.hash[key.bucket()];
        while i != NIL {
            let e = self.e(i);
            if e.key == *key {
                return Some(i);
            }
            i = e.hash_next;
        }
        None
    }

    fn lru_push_head(&mut self, i: u32) {
        let head = self.lru_head;
        self.em(i).lru_prev = NIL;
        self.em(i).lru_next = head;
        if head != NIL {
            self.em(head).lru_prev = i;
        }
        self.lru_head = i;
        if self.lru_tail == NIL {
            self.lru_tail = i;
        }
    }

    fn lru_unlink(&mut self, i: u32) {
        let (prev, next) = {
            let e = self.e(i);
            (e.lru_prev, e.lru_next)
        };
        if prev != NIL {
            self.em(prev).lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.em(next).lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
        let e = self.em(i);
        e.lru_prev = NIL;
        e.lru_next = NIL;
    }

    fn touch(&mut self, i: u32) {
        self.lru_unlink(i);
        self.lru_push_head(i);
    }

    /// Removes `i` from every structure and recycles the slot.
    fn release_slot(&mut self, i: u32) {
        self.hash_remove(i);
        self.lru_unlink(i);
        let _ = self.slots[i as usize].take();
        self.free.push(i);
        self.npages -= 1;
    }
}

impl PageCache {
    pub fn new(max_pages: usize, backing: Arc<dyn PageIo>) -> Self {
        Self {
            max_pages,
            backing,
            inner: SpinLock::new(
                "page cache",
                PcInner {
                    slots: Vec::new(),
                    free: Vec::new(),
                    hash: [NIL; NBUCKET],
                    lru_head: NIL,
                    lru_tail: NIL,
                    npages: 0,
                    stats: PageCacheStats::default(),
                },
            ),
        }
    }

    pub fn stats(&self) -> PageCacheStats {
        self.inner.lock().stats
    }

    pub fn resident(&self) -> usize {
        self.inner.lock().npages
    }

    /// Looks up or creates the entry for `key` and takes a reference on
    /// it. A freshly created entry has no flags set; the caller decides
    /// whether to load it.
    pub fn get(&self, key: PageKey) -> Result<PageId> {
        loop {
            let mut inner = self.inner.lock();
            if let Some(i) = inner.hash_find(&key) {
                inner.stats.hits += 1;
                inner.em(i).refcnt += 1;
                inner.touch(i);
                return Ok(PageId(i));
            }

            if inner.npages >= self.max_pages {
                // At capacity: push something out first. The helper may
                // drop and retake the cache lock, so the lookup restarts.
                if !self.evict_one(&mut inner) {
                    return Err(KernelError::OutOfMemory);
                }
                drop(inner);
                continue;
            }

            let frame = PhysPages::alloc_one()?;
            let entry = Box::new(PageEntry {
                key,
                frame,
                flags: PageFlags::empty(),
                refcnt: 1,
                mapcnt: 0,
                hash_next: NIL,
                hash_prev: NIL,
                lru_next: NIL,
                lru_prev: NIL,
            });
            let i = match inner.free.pop() {
                Some(i) => {
                    inner.slots[i as usize] = Some(entry);
                    i
                }
                None => {
                    inner.slots.push(Some(entry));
                    (inner.slots.len() - 1) as u32
                }
            };
            inner.hash_insert(i);
            inner.lru_push_head(i);
            inner.npages += 1;
            inner.stats.misses += 1;
            return Ok(PageId(i));
        }
    }

    /// Non-allocating lookup; takes a reference on hit.
    pub fn find(&self, key: PageKey) -> Option<PageId> {
        let mut inner = self.inner.lock();
        let i = inner.hash_find(&key)?;
        inner.stats.hits += 1;
        inner.em(i).refcnt += 1;
        inner.touch(i);
        Some(PageId(i))
    }

    /// Returns a reference taken by `get`/`find`.
    pub fn put(&self, id: PageId) {
        let mut inner = self.inner.lock();
        let e = inner.em(id.0);
        assert!(e.refcnt > 0, "page refcount underflow");
        e.refcnt -= 1;
    }

    /// Takes the entry's cooperative lock, yielding while it is held
    /// elsewhere. The caller must hold a reference.
    pub fn lock_entry(&self, id: PageId) {
        loop {
            {
                let mut inner = self.inner.lock();
                let e = inner.em(id.0);
                if !e.flags.contains(PageFlags::LOCKED) {
                    e.flags |= PageFlags::LOCKED;
                    return;
                }
            }
            scheduler::yield_now();
        }
    }

    pub fn unlock_entry(&self, id: PageId) {
        let mut inner = self.inner.lock();
        let e = inner.em(id.0);
        assert!(e.flags.contains(PageFlags::LOCKED));
        e.flags &= !PageFlags::LOCKED;
    }

    /// Sets DIRTY, but only on a VALID entry.
    pub fn mark_dirty(&self, id: PageId) {
        let mut inner = self.inner.lock();
        let e = inner.em(id.0);
        if e.flags.contains(PageFlags::VALID) {
            e.flags |= PageFlags::DIRTY;
        }
    }

    pub fn flags(&self, id: PageId) -> PageFlags {
        self.inner.lock().e(id.0).flags
    }

    pub fn key_of(&self, id: PageId) -> PageKey {
        self.inner.lock().e(id.0).key
    }

    /// Loads the page from the backing store unless it is already
    /// UPTODATE. The caller holds the entry lock.
    fn ensure_uptodate(&self, id: PageId) -> Result<()> {
        let (key, ptr, uptodate) = {
            let inner = self.inner.lock();
            let e = inner.e(id.0);
            debug_assert!(e.flags.contains(PageFlags::LOCKED));
            (e.key, e.frame.as_ptr(), e.flags.contains(PageFlags::UPTODATE))
        };
        if uptodate {
            return Ok(());
        }
        // SAFETY: the frame outlives the entry, which cannot be evicted
        // while LOCKED, and the entry lock serializes data access.
        let buf = unsafe { core::slice::from_raw_parts_mut(ptr, PGSIZE) };
        match self.backing.read_inode(key.dev, key.inum, key.byte_offset(), buf) {
            Ok(n) => {
                buf[n..].fill(0);
                let mut inner = self.inner.lock();
                inner.em(id.0).flags |= PageFlags::VALID | PageFlags::UPTODATE;
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.em(id.0).flags |= PageFlags::ERROR;
                Err(e)
            }
        }
    }

    /// Byte-granular read decomposed into page operations.
    pub fn read(&self, dev: DeviceId, inum: u32, mut off: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let index = (off / PGSIZE as u64) as u32;
            let in_page = (off % PGSIZE as u64) as usize;
            let n = (PGSIZE - in_page).min(buf.len() - done);

            let id = self.get(PageKey::new(dev, inum, index))?;
            self.lock_entry(id);
            let res = self.ensure_uptodate(id);
            if res.is_ok() {
                let ptr = self.inner.lock().e(id.0).frame.as_ptr();
                // SAFETY: entry is LOCKED and referenced; the frame is
                // stable and the lock serializes data access.
                let page = unsafe { core::slice::from_raw_parts(ptr, PGSIZE) };
                buf[done..done + n].copy_from_slice(&page[in_page..in_page + n]);
            }
            self.unlock_entry(id);
            self.put(id);
            res?;

            done += n;
            off += n as u64;
        }
        Ok(done)
    }

    /// Byte-granular write. Partial pages are read from the backing
    /// store first when not UPTODATE, so the untouched bytes survive.
    pub fn write(&self, dev: DeviceId, inum: u32, mut off: u64, buf: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let index = (off / PGSIZE as u64) as u32;
            let in_page = (off % PGSIZE as u64) as usize;
            let n = (PGSIZE - in_page).min(buf.len() - done);

            let id = self.get(PageKey::new(dev, inum, index))?;
            self.lock_entry(id);
            let res = if n < PGSIZE {
                self.ensure_uptodate(id)
            } else {
                Ok(())
            };
            if res.is_ok() {
                let ptr = self.inner.lock().e(id.0).frame.as_ptr();
                // SAFETY: entry is LOCKED and referenced.
                let page = unsafe { core::slice::from_raw_parts_mut(ptr, PGSIZE) };
                page[in_page..in_page + n].copy_from_slice(&buf[done..done + n]);
                let mut inner = self.inner.lock();
                let e = inner.em(id.0);
                e.flags |= PageFlags::VALID | PageFlags::UPTODATE;
                e.flags |= PageFlags::DIRTY;
            }
            self.unlock_entry(id);
            self.put(id);
            res?;

            done += n;
            off += n as u64;
        }
        Ok(done)
    }

    /// Writes one page back if dirty. The caller holds a reference; the
    /// entry lock is taken here. DIRTY is cleared only on success.
    pub fn writeback_page(&self, id: PageId) -> Result<bool> {
        self.lock_entry(id);
        let res = self.writeback_locked(id);
        self.unlock_entry(id);
        res
    }

    fn writeback_locked(&self, id: PageId) -> Result<bool> {
        let (key, ptr, dirty) = {
            let inner = self.inner.lock();
            let e = inner.e(id.0);
            (e.key, e.frame.as_ptr(), e.flags.contains(PageFlags::DIRTY))
        };
        if !dirty {
            return Ok(false);
        }

        let size = self.backing.stat_inode(key.dev, key.inum)?;
        let off = key.byte_offset();
        let n = if size > off {
            (size - off).min(PGSIZE as u64) as usize
        } else {
            0
        };
        if n > 0 {
            // SAFETY: entry is LOCKED and referenced.
            let page = unsafe { core::slice::from_raw_parts(ptr, PGSIZE) };
            match self.backing.write_inode(key.dev, key.inum, off, &page[..n]) {
                Ok(_) => {}
                Err(e) => {
                    let mut inner = self.inner.lock();
                    inner.em(id.0).flags |= PageFlags::ERROR;
                    return Err(e);
                }
            }
        }
        let mut inner = self.inner.lock();
        let e = inner.em(id.0);
        e.flags &= !PageFlags::DIRTY;
        inner.stats.writebacks += 1;
        Ok(true)
    }

    /// Flushes every dirty page of one file. Returns pages written; any
    /// failure surfaces as an error with DIRTY left set on the victims.
    pub fn sync_file(&self, dev: DeviceId, inum: u32) -> Result<usize> {
        self.sync_matching(|k| k.dev == dev && k.inum == inum)
    }

    /// Flushes every dirty page in the cache.
    pub fn sync_all(&self) -> Result<usize> {
        self.sync_matching(|_| true)
    }

    fn sync_matching<F: Fn(&PageKey) -> bool>(&self, matches: F) -> Result<usize> {
        let targets: Vec<u32> = {
            let mut inner = self.inner.lock();
            let mut v = Vec::new();
            for i in 0..inner.slots.len() as u32 {
                let dirty = match inner.slots[i as usize].as_deref() {
                    Some(e) => e.flags.contains(PageFlags::DIRTY) && matches(&e.key),
                    None => false,
                };
                if dirty {
                    inner.em(i).refcnt += 1;
                    v.push(i);
                }
            }
            v
        };

        let mut written = 0;
        let mut first_err = None;
        for i in targets {
            let id = PageId(i);
            match self.writeback_page(id) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => first_err = Some(e),
            }
            self.put(id);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Drops every resident page of a file whose reference count is
    /// zero. Returns the number removed.
    pub fn invalidate_file(&self, dev: DeviceId, inum: u32) -> usize {
        self.invalidate_matching(|k| k.dev == dev && k.inum == inum)
    }

    /// Drops zero-referenced pages of a file overlapping `[start, end)`
    /// byte offsets.
    pub fn invalidate_range(&self, dev: DeviceId, inum: u32, start: u64, end: u64) -> usize {
        let first = (start / PGSIZE as u64) as u32;
        let last = (end.saturating_add(PGSIZE as u64 - 1) / PGSIZE as u64) as u32;
        self.invalidate_matching(|k| {
            k.dev == dev && k.inum == inum && k.index >= first && k.index < last
        })
    }

    fn invalidate_matching<F: Fn(&PageKey) -> bool>(&self, matches: F) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for i in 0..inner.slots.len() as u32 {
            let evictable = match inner.slots[i as usize].as_deref() {
                Some(e) => {
                    e.refcnt == 0 && !e.flags.contains(PageFlags::LOCKED) && matches(&e.key)
                }
                None => false,
            };
            if evictable {
                inner.release_slot(i);
                removed += 1;
            }
        }
        removed
    }

    /// Evicts until at most `target` pages remain, preferring clean
    /// entries and writing dirty ones back when needed. Returns the
    /// number evicted.
    pub fn shrink(&self, target: usize) -> usize {
        let mut evicted = 0;
        loop {
            let mut inner = self.inner.lock();
            if inner.npages <= target {
                return evicted;
            }
            if !self.evict_candidate(&mut inner, false)
                && !self.evict_candidate(&mut inner, true)
            {
                return evicted;
            }
            evicted += 1;
        }
    }

    /// Walks the LRU from the tail and evicts the first entry with a
    /// zero reference count and no LOCKED bit. A dirty victim is written
    /// back with the cache lock dropped around the I/O; a write failure
    /// moves on to the next candidate. Returns false when nothing could
    /// be evicted.
    ///
    /// On return the cache lock in `inner` is held again, but it may
    /// have been released in between, so callers must revalidate any
    /// lookups they did before the call.
    fn evict_one(&self, inner: &mut crate::lock::SpinLockGuard<'_, PcInner>) -> bool {
        self.evict_candidate(inner, true)
    }

    fn evict_candidate(
        &self,
        inner: &mut crate::lock::SpinLockGuard<'_, PcInner>,
        allow_dirty: bool,
    ) -> bool {
        let mut cursor = inner.lru_tail;
        while cursor != NIL {
            let i = cursor;
            let (refcnt, flags, key, ptr) = {
                let e = inner.e(i);
                (e.refcnt, e.flags, e.key, e.frame.as_ptr())
            };
            cursor = inner.e(i).lru_prev;

            if refcnt != 0 || flags.contains(PageFlags::LOCKED) {
                continue;
            }
            if flags.contains(PageFlags::DIRTY) && !allow_dirty {
                continue;
            }

            if flags.contains(PageFlags::DIRTY) {
                // Never carry the cache lock across I/O: lock the entry,
                // drop the cache lock, write, retake.
                inner.em(i).flags |= PageFlags::LOCKED;
                let write_res = inner.reacquire_after(|| {
                    let size = self.backing.stat_inode(key.dev, key.inum)?;
                    let off = key.byte_offset();
                    let n = if size > off {
                        (size - off).min(PGSIZE as u64) as usize
                    } else {
                        0
                    };
                    if n > 0 {
                        // SAFETY: LOCKED holds the entry in place.
                        let page = unsafe { core::slice::from_raw_parts(ptr, PGSIZE) };
                        let _ = self.backing.write_inode(key.dev, key.inum, off, &page[..n])?;
                    }
                    Ok::<(), KernelError>(())
                });
                inner.em(i).flags &= !PageFlags::LOCKED;
                match write_res {
                    Ok(()) => {
                        inner.em(i).flags &= !PageFlags::DIRTY;
                        inner.stats.writebacks += 1;
                    }
                    Err(_) => {
                        inner.em(i).flags |= PageFlags::ERROR;
                        // The list may have changed while unlocked.
                        cursor = inner.lru_tail;
                        continue;
                    }
                }
                // Someone may have referenced it while we wrote.
                if inner.e(i).refcnt != 0 {
                    cursor = inner.lru_tail;
                    continue;
                }
            }

            inner.release_slot(i);
            inner.stats.evictions += 1;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Backing double: files as growable byte vectors.
    struct MemBacking {
        files: Mutex<BTreeMap<(DeviceId, u32), Vec<u8>>>,
        fail_writes: AtomicBool,
    }

    impl MemBacking {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                files: Mutex::new(BTreeMap::new()),
                fail_writes: AtomicBool::new(false),
            })
        }

        fn put_file(&self, dev: DeviceId, inum: u32, data: &[u8]) {
            let _ = self
                .files
                .lock()
                .unwrap()
                .insert((dev, inum), data.to_vec());
        }

        fn file(&self, dev: DeviceId, inum: u32) -> Vec<u8> {
            self.files
                .lock()
                .unwrap()
                .get(&(dev, inum))
                .cloned()
                .unwrap_or_default()
        }
    }

    impl PageIo for MemBacking {
        fn read_inode(&self, dev: DeviceId, inum: u32, off: u64, buf: &mut [u8]) -> Result<usize> {
            let files = self.files.lock().unwrap();
            let data = files.get(&(dev, inum)).map(|v| v.as_slice()).unwrap_or(&[]);
            let off = off as usize;
            if off >= data.len() {
                return Ok(0);
            }
            let n = (data.len() - off).min(buf.len());
            buf[..n].copy_from_slice(&data[off..off + n]);
            Ok(n)
        }

        fn write_inode(&self, dev: DeviceId, inum: u32, off: u64, buf: &[u8]) -> Result<usize> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(KernelError::Io);
            }
            let mut files = self.files.lock().unwrap();
            let data = files.entry((dev, inum)).or_default();
            let end = off as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[off as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn stat_inode(&self, dev: DeviceId, inum: u32) -> Result<u64> {
            Ok(self.file(dev, inum).len() as u64)
        }
    }

    fn cache(max: usize) -> (PageCache, Arc<MemBacking>) {
        let backing = MemBacking::new();
        (PageCache::new(max, backing.clone()), backing)
    }

    #[test]
    fn one_entry_per_key_at_any_time() {
        let (pc, _b) = cache(16);
        let key = PageKey::new(1, 10, 0);
        let a = pc.get(key).unwrap();
        let b = pc.get(key).unwrap();
        assert_eq!(a, b);
        assert_eq!(pc.resident(), 1);
        pc.put(a);
        pc.put(b);
    }

    #[test]
    fn dirty_implies_valid() {
        let (pc, _b) = cache(16);
        let id = pc.get(PageKey::new(1, 10, 0)).unwrap();
        // Fresh entry: not VALID, so mark_dirty must not stick.
        pc.mark_dirty(id);
        assert!(!pc.flags(id).contains(PageFlags::DIRTY));
        pc.put(id);

        assert_eq!(pc.write(1, 10, 0, b"x").unwrap(), 1);
        let id = pc.find(PageKey::new(1, 10, 0)).unwrap();
        let flags = pc.flags(id);
        assert!(flags.contains(PageFlags::VALID));
        assert!(flags.contains(PageFlags::DIRTY));
        pc.put(id);
    }

    #[test]
    fn partial_page_write_preserves_surrounding_bytes() {
        let (pc, b) = cache(16);
        b.put_file(1, 5, &vec![0x55u8; 100]);
        assert_eq!(pc.write(1, 5, 10, b"ABCD").unwrap(), 4);
        let mut out = [0u8; 100];
        assert_eq!(pc.read(1, 5, 0, &mut out).unwrap(), 100);
        assert_eq!(&out[..10], &[0x55u8; 10][..]);
        assert_eq!(&out[10..14], b"ABCD");
        assert_eq!(&out[14..], &[0x55u8; 86][..]);
    }

    #[test]
    fn write_writeback_invalidate_read_round_trips() {
        let (pc, b) = cache(16);
        b.put_file(1, 9, &vec![0u8; 8192]);
        let payload = b"round trip payload";
        assert_eq!(pc.write(1, 9, 100, payload).unwrap(), payload.len());

        let id = pc.find(PageKey::new(1, 9, 0)).unwrap();
        assert!(pc.writeback_page(id).unwrap());
        pc.put(id);

        let resident = pc.resident();
        assert_eq!(pc.invalidate_file(1, 9), resident);
        assert_eq!(pc.resident(), 0);

        let mut out = [0u8; 18];
        assert_eq!(pc.read(1, 9, 100, &mut out).unwrap(), payload.len());
        assert_eq!(&out, payload);
    }

    #[test]
    fn capacity_is_enforced_under_sequential_pressure() {
        // Scenario S4 at 1/8 scale: twice the capacity in distinct pages.
        let max = 128;
        let (pc, b) = cache(max);
        b.put_file(1, 3, &vec![7u8; 2 * max * PGSIZE]);
        let mut buf = [0u8; 32];
        for page in 0..(2 * max) as u64 {
            let _ = pc.read(1, 3, page * PGSIZE as u64, &mut buf).unwrap();
            assert!(pc.resident() <= max);
        }
        let stats = pc.stats();
        assert!(stats.misses >= 2 * max as u64);
        assert_eq!(stats.hits, 0);
        assert_eq!(buf, [7u8; 32]);
    }

    #[test]
    fn failed_writeback_keeps_dirty_set() {
        // Scenario S5: inject an I/O error on write_inode.
        let (pc, b) = cache(16);
        b.put_file(1, 4, &vec![0u8; PGSIZE]);
        assert_eq!(pc.write(1, 4, 0, b"doomed").unwrap(), 6);
        b.fail_writes.store(true, Ordering::Relaxed);

        assert!(pc.sync_all().is_err());
        let id = pc.find(PageKey::new(1, 4, 0)).unwrap();
        assert!(pc.flags(id).contains(PageFlags::DIRTY));
        pc.put(id);

        // The error is transient; a later sync succeeds and clears it.
        b.fail_writes.store(false, Ordering::Relaxed);
        assert_eq!(pc.sync_all().unwrap(), 1);
        let id = pc.find(PageKey::new(1, 4, 0)).unwrap();
        assert!(!pc.flags(id).contains(PageFlags::DIRTY));
        pc.put(id);
    }

    #[test]
    fn pinned_pages_are_never_evicted() {
        let (pc, b) = cache(4);
        b.put_file(1, 2, &vec![1u8; 16 * PGSIZE]);
        let pinned = pc.get(PageKey::new(1, 2, 0)).unwrap();
        let mut buf = [0u8; 1];
        for page in 1..12u64 {
            let _ = pc.read(1, 2, page * PGSIZE as u64, &mut buf).unwrap();
        }
        // Still resident in spite of the pressure.
        let again = pc.find(PageKey::new(1, 2, 0)).expect("pinned page evicted");
        pc.put(again);
        pc.put(pinned);
    }

    #[test]
    fn shrink_prefers_clean_but_flushes_dirty_when_needed() {
        let (pc, b) = cache(16);
        b.put_file(1, 6, &vec![0u8; 8 * PGSIZE]);
        let mut buf = [0u8; 1];
        for page in 0..4u64 {
            let _ = pc.read(1, 6, page * PGSIZE as u64, &mut buf).unwrap();
        }
        assert_eq!(pc.write(1, 6, 4 * PGSIZE as u64, b"dirty").unwrap(), 5);
        assert_eq!(pc.resident(), 5);

        assert_eq!(pc.shrink(0), 5);
        assert_eq!(pc.resident(), 0);
        // The dirty page reached the backing store on its way out.
        assert_eq!(&b.file(1, 6)[4 * PGSIZE..4 * PGSIZE + 5], b"dirty");
    }
}
