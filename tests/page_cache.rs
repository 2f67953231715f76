//! Page-cache behavior at the configured scale, and writeback error
//! retry through the whole stack.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use coal_kernel::bio::Bcache;
use coal_kernel::device::DeviceId;
use coal_kernel::error::Result;
use coal_kernel::file::FileTable;
use coal_kernel::fs::fat::FatDriver;
use coal_kernel::fs::{OpenFlags, Path, Vfs};
use coal_kernel::page_cache::{PageCache, PageIo, PageKey};
use coal_kernel::param::{MAXPAGES, PGSIZE};

/// Synthetic backing: every file byte is a function of its offset, no
/// storage behind it.
struct SynthBacking;

impl PageIo for SynthBacking {
    fn read_inode(&self, _dev: DeviceId, _inum: u32, off: u64, buf: &mut [u8]) -> Result<usize> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = ((off as usize + i) % 251) as u8;
        }
        Ok(buf.len())
    }

    fn write_inode(&self, _dev: DeviceId, _inum: u32, _off: u64, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }

    fn stat_inode(&self, _dev: DeviceId, _inum: u32) -> Result<u64> {
        Ok(u64::MAX)
    }
}

#[test]
fn s4_sequential_pressure_at_full_scale() {
    // MAX_PAGES=1024; touch 2048 distinct pages sequentially.
    let pc = PageCache::new(MAXPAGES, Arc::new(SynthBacking));
    let mut byte = [0u8; 1];
    for page in 0..(2 * MAXPAGES) as u64 {
        let off = page * PGSIZE as u64;
        assert_eq!(pc.read(1, 1, off, &mut byte).unwrap(), 1);
        assert_eq!(byte[0], (off % 251) as u8);
        assert!(pc.resident() <= MAXPAGES, "resident never exceeds the cap");
    }
    let stats = pc.stats();
    assert!(stats.misses >= 2 * MAXPAGES as u64);
    assert_eq!(stats.hits, 0);
    assert!(stats.evictions >= MAXPAGES as u64);
}

#[test]
fn repeated_reads_hit_without_new_misses() {
    let pc = PageCache::new(64, Arc::new(SynthBacking));
    let mut buf = [0u8; 128];
    for _ in 0..10 {
        let _ = pc.read(1, 2, 4096, &mut buf).unwrap();
    }
    let stats = pc.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 9);
}

#[test]
fn disk_write_failure_keeps_buffers_dirty_for_retry() {
    let (disk, dev) = common::fat32_disk("retry");
    let vfs = Vfs::new();
    let bcache = Arc::new(Bcache::new());
    vfs.register_driver(Arc::new(FatDriver::new(bcache.clone())))
        .unwrap();
    vfs.mount_root("/", "fat", dev).unwrap();
    let ftable = FileTable::new();

    let f = ftable
        .open_path(
            &vfs,
            Path::new(b"/x.bin"),
            OpenFlags::O_CREAT | OpenFlags::O_RDWR,
        )
        .unwrap();
    f.write(&vfs, b"must reach the disk").unwrap();

    // First sync: the page flushes into the buffer cache, but the disk
    // rejects the sectors. Nothing is lost.
    disk.fail_writes.store(true, Ordering::Relaxed);
    assert!(vfs.sync_all().is_err());
    let writes_while_failing = disk.writes.load(Ordering::Relaxed);
    assert_eq!(writes_while_failing, 0);

    // The device recovers; a later sync lands everything.
    disk.fail_writes.store(false, Ordering::Relaxed);
    vfs.sync_all().unwrap();
    assert!(disk.writes.load(Ordering::Relaxed) > 0);

    // Remount and confirm the bytes made it out.
    let vfs2 = Vfs::new();
    let bcache2 = Arc::new(Bcache::new());
    vfs2.register_driver(Arc::new(FatDriver::new(bcache2)))
        .unwrap();
    vfs2.mount_root("/", "fat", dev).unwrap();
    let f2 = ftable
        .open_path(&vfs2, Path::new(b"/x.bin"), OpenFlags::empty())
        .unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(f2.read(&vfs2, &mut buf).unwrap(), 19);
    assert_eq!(&buf[..19], b"must reach the disk");
}

#[test]
fn dirty_pages_survive_until_their_writeback_succeeds() {
    let pc = PageCache::new(16, Arc::new(SynthBacking));
    assert_eq!(pc.write(3, 7, 0, b"dirty bytes").unwrap(), 11);
    let id = pc.find(PageKey::new(3, 7, 0)).unwrap();
    assert!(pc
        .flags(id)
        .contains(coal_kernel::page_cache::PageFlags::DIRTY));
    assert!(pc.writeback_page(id).unwrap());
    assert!(!pc
        .flags(id)
        .contains(coal_kernel::page_cache::PageFlags::DIRTY));
    pc.put(id);
}
