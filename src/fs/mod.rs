//! Virtual filesystem.
//!
//! Owns the registry of filesystem drivers, the mount table, and the
//! bridge that lets the page cache reach a file's bytes by
//! `(device, inode)` without going through file handles. The per-mount
//! capability record is the `MountedFs` trait: a vtable of operation
//! contracts the driver fills in; the driver downcasts its own context
//! internally.
//!
//! File-handle level operations (offsets, read-ahead, the open-file
//! table) live in `crate::file`; this module stops at vnodes.

pub mod fat;
pub mod path;
pub mod readahead;

pub use path::{FileName, Path};

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::device::DeviceId;
use crate::error::{KernelError, Result};
use crate::lock::SpinLock;
use crate::page_cache::{PageCache, PageIo};
use crate::param::{MAXNAME, MAXPAGES};

bitflags! {
    /// Open flags, bit-stable with the POSIX values userland passes.
    pub struct OpenFlags: u32 {
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREAT = 0x40;
        const O_EXCL = 0x80;
        const O_TRUNC = 0x200;
        const O_APPEND = 0x400;
    }
}

impl OpenFlags {
    /// O_RDONLY is the absence of the write bits.
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::O_WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VnodeKind {
    File,
    Dir,
}

/// Filesystem-agnostic handle to one object. Lives at least as long as
/// any open file handle referring to it.
pub struct Vnode {
    pub dev: DeviceId,
    pub inum: u32,
    pub kind: VnodeKind,
    size: SpinLock<u64>,
}

impl Vnode {
    pub fn new(dev: DeviceId, inum: u32, kind: VnodeKind, size: u64) -> Self {
        Self {
            dev,
            inum,
            kind,
            size: SpinLock::new("vnode size", size),
        }
    }

    pub fn size(&self) -> u64 {
        *self.size.lock()
    }

    pub fn set_size(&self, size: u64) {
        *self.size.lock() = size;
    }

    pub fn is_dir(&self) -> bool {
        self.kind == VnodeKind::Dir
    }
}

/// Metadata snapshot for stat-style calls.
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub dev: DeviceId,
    pub inum: u32,
    pub kind: VnodeKind,
    pub size: u64,
}

/// One directory entry as reported by readdir.
#[derive(Clone)]
pub struct DirEntry {
    pub name: ArrayVec<u8, MAXNAME>,
    pub kind: VnodeKind,
    pub inum: u32,
    pub size: u32,
}

/// Per-mount capability record.
pub trait MountedFs: Send + Sync {
    fn device(&self) -> DeviceId;

    fn root(&self) -> Result<Arc<Vnode>>;

    /// Resolves `path` (relative to the mount root) to a vnode.
    fn lookup(&self, path: &Path) -> Result<Arc<Vnode>>;

    /// Opens, honoring O_CREAT, O_EXCL and O_TRUNC.
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Arc<Vnode>>;

    /// Raw file read by inode, below the page cache.
    fn read_inode(&self, inum: u32, off: u64, buf: &mut [u8]) -> Result<usize>;

    /// Raw file write by inode. The range must already be allocated.
    fn write_inode(&self, inum: u32, off: u64, buf: &[u8]) -> Result<usize>;

    /// Current size by inode.
    fn stat_inode(&self, inum: u32) -> Result<u64>;

    /// Allocates backing space and grows the size so that a write of
    /// `len` bytes at `off` through the page cache can later be flushed.
    fn prepare_write(&self, vnode: &Vnode, off: u64, len: usize) -> Result<()>;

    /// Reads the entry at directory position `pos`; returns the entry
    /// and the next position, or None at the end.
    fn readdir(&self, vnode: &Vnode, pos: u32) -> Result<Option<(DirEntry, u32)>>;

    fn unlink(&self, path: &Path) -> Result<()>;

    fn mkdir(&self, path: &Path) -> Result<()>;

    fn rmdir(&self, path: &Path) -> Result<()>;

    /// Releases driver-side state for a vnode going away.
    fn close(&self, vnode: &Vnode);

    /// Flushes driver metadata (FAT table, directory sectors) to disk.
    fn sync(&self) -> Result<()>;

    fn unmount(&self) -> Result<()>;
}

/// A registered filesystem implementation.
pub trait FileSystemDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn mount(&self, dev: DeviceId) -> Result<Arc<dyn MountedFs>>;
}

struct Mount {
    point: ArrayVec<u8, MAXNAME>,
    dev: DeviceId,
    fs: Arc<dyn MountedFs>,
}

/// The process-wide VFS singleton (one per kernel; tests build their
/// own). Driver registry and mount table are guarded by the outermost
/// locks in the kernel's lock order.
pub struct Vfs {
    drivers: SpinLock<Vec<Arc<dyn FileSystemDriver>>>,
    mounts: SpinLock<Vec<Mount>>,
    page_cache: spin::Once<PageCache>,
    readahead: readahead::ReadAhead,
}

/// The page cache's view of the VFS: inode I/O routed to the owning
/// driver by device id.
struct VfsBacking {
    vfs: Weak<Vfs>,
}

impl VfsBacking {
    fn vfs(&self) -> Result<Arc<Vfs>> {
        self.vfs.upgrade().ok_or(KernelError::Io)
    }
}

impl PageIo for VfsBacking {
    fn read_inode(&self, dev: DeviceId, inum: u32, off: u64, buf: &mut [u8]) -> Result<usize> {
        self.vfs()?.read_at(dev, inum, off, buf)
    }

    fn write_inode(&self, dev: DeviceId, inum: u32, off: u64, buf: &[u8]) -> Result<usize> {
        self.vfs()?.write_at(dev, inum, off, buf)
    }

    fn stat_inode(&self, dev: DeviceId, inum: u32) -> Result<u64> {
        self.vfs()?.get_file_size(dev, inum)
    }
}

impl Vfs {
    pub fn new() -> Arc<Self> {
        Self::with_cache_size(MAXPAGES)
    }

    pub fn with_cache_size(max_pages: usize) -> Arc<Self> {
        let vfs = Arc::new(Self {
            drivers: SpinLock::new("driver registry", Vec::new()),
            mounts: SpinLock::new("mount table", Vec::new()),
            page_cache: spin::Once::new(),
            readahead: readahead::ReadAhead::new(),
        });
        let backing = Arc::new(VfsBacking {
            vfs: Arc::downgrade(&vfs),
        });
        let _ = vfs
            .page_cache
            .call_once(|| PageCache::new(max_pages, backing));
        vfs
    }

    pub fn cache(&self) -> &PageCache {
        self.page_cache.get().expect("page cache initialized in new")
    }

    pub fn readahead(&self) -> &readahead::ReadAhead {
        &self.readahead
    }

    pub fn register_driver(&self, driver: Arc<dyn FileSystemDriver>) -> Result<()> {
        let mut drivers = self.drivers.lock();
        if drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(KernelError::AlreadyExists);
        }
        drivers.push(driver);
        Ok(())
    }

    pub fn unregister_driver(&self, name: &str) -> Result<()> {
        let mut drivers = self.drivers.lock();
        let pos = drivers
            .iter()
            .position(|d| d.name() == name)
            .ok_or(KernelError::NotFound)?;
        let _ = drivers.remove(pos);
        Ok(())
    }

    /// Instantiates `fs_name` on `dev` and records it at `mount_point`.
    pub fn mount_root(&self, mount_point: &str, fs_name: &str, dev: DeviceId) -> Result<()> {
        let driver = self
            .drivers
            .lock()
            .iter()
            .find(|d| d.name() == fs_name)
            .cloned()
            .ok_or(KernelError::NotFound)?;

        let mut mounts = self.mounts.lock();
        if mounts
            .iter()
            .any(|m| m.point.as_slice() == mount_point.as_bytes() || m.dev == dev)
        {
            return Err(KernelError::AlreadyExists);
        }
        let fs = driver.mount(dev)?;
        let mut point = ArrayVec::new();
        point
            .try_extend_from_slice(mount_point.as_bytes())
            .map_err(|_| KernelError::NameTooLong)?;
        mounts.push(Mount { point, dev, fs });
        Ok(())
    }

    pub fn unmount(&self, mount_point: &str) -> Result<()> {
        let mut mounts = self.mounts.lock();
        let pos = mounts
            .iter()
            .position(|m| m.point.as_slice() == mount_point.as_bytes())
            .ok_or(KernelError::NotFound)?;
        mounts[pos].fs.unmount()?;
        let _ = mounts.remove(pos);
        Ok(())
    }

    /// The filesystem an absolute path resolves under. Only the root
    /// mount is required, so this is the mount at `/`.
    pub fn root_mount(&self) -> Result<Arc<dyn MountedFs>> {
        self.mounts
            .lock()
            .iter()
            .find(|m| m.point.as_slice() == b"/")
            .map(|m| m.fs.clone())
            .ok_or(KernelError::NotFound)
    }

    pub fn mount_for_dev(&self, dev: DeviceId) -> Result<Arc<dyn MountedFs>> {
        self.mounts
            .lock()
            .iter()
            .find(|m| m.dev == dev)
            .map(|m| m.fs.clone())
            .ok_or(KernelError::NotFound)
    }

    /// Opens `path` into a vnode, wrapping the root mount's driver.
    pub fn open(&self, path: &Path, flags: OpenFlags) -> Result<(Arc<dyn MountedFs>, Arc<Vnode>)> {
        let fs = self.root_mount()?;
        let vnode = fs.open(path, flags)?;
        Ok((fs, vnode))
    }

    pub fn lookup(&self, path: &Path) -> Result<(Arc<dyn MountedFs>, Arc<Vnode>)> {
        let fs = self.root_mount()?;
        let vnode = fs.lookup(path)?;
        Ok((fs, vnode))
    }

    /// Raw inode read for the page cache, bypassing file handles.
    pub fn read_at(&self, dev: DeviceId, inum: u32, off: u64, buf: &mut [u8]) -> Result<usize> {
        self.mount_for_dev(dev)?.read_inode(inum, off, buf)
    }

    /// Raw inode write for the page cache.
    pub fn write_at(&self, dev: DeviceId, inum: u32, off: u64, buf: &[u8]) -> Result<usize> {
        self.mount_for_dev(dev)?.write_inode(inum, off, buf)
    }

    pub fn get_file_size(&self, dev: DeviceId, inum: u32) -> Result<u64> {
        self.mount_for_dev(dev)?.stat_inode(inum)
    }

    /// Flushes dirty pages and driver metadata everywhere.
    pub fn sync_all(&self) -> Result<usize> {
        let written = self.cache().sync_all()?;
        let mounts: Vec<Arc<dyn MountedFs>> =
            self.mounts.lock().iter().map(|m| m.fs.clone()).collect();
        for fs in mounts {
            fs.sync()?;
        }
        Ok(written)
    }
}
