//! Open files.
//!
//! A `File` is the kernel-global open-file object: what it points at,
//! the open mode, and the byte offset behind its own sleep lock so that
//! reads and writes on one handle serialize. Handles are shared across
//! fork and dup through `Arc`; the `FileTable` caps how many live at
//! once system-wide.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::console;
use crate::error::{KernelError, Result};
use crate::fs::{MountedFs, OpenFlags, Stat, Vfs, Vnode};
use crate::lock::{SleepLock, SpinLock};
use crate::param::{NFILE, RATHRESHOLD};
use crate::pipe::Pipe;

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

pub enum FileKind {
    /// A filesystem object, with the driver that owns it.
    Vnode {
        fs: Arc<dyn MountedFs>,
        vnode: Arc<Vnode>,
    },
    /// One end of a pipe.
    Pipe { pipe: Arc<Pipe> },
    /// The terminal, standing in for fds 0-2.
    Console,
}

pub struct File {
    /// Unique handle id; tags read-ahead windows.
    id: u64,
    pub kind: FileKind,
    readable: bool,
    writable: bool,
    append: bool,
    /// Byte offset; the offset lock of the handle.
    offset: SleepLock<u64>,
}

pub type RcFile = Arc<File>;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

impl File {
    fn new(kind: FileKind, readable: bool, writable: bool, append: bool) -> Self {
        Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            readable,
            writable,
            append,
            offset: SleepLock::new("file offset", 0),
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Reads into `buf` at the handle offset, advancing it. Filesystem
    /// reads are served from a read-ahead window when the whole range
    /// is resident, otherwise through the page cache; successful long
    /// reads refill a window.
    pub fn read(&self, vfs: &Vfs, buf: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(KernelError::BadFd);
        }
        match &self.kind {
            FileKind::Console => Ok(console::read_line(buf)),
            FileKind::Pipe { pipe } => pipe.read(buf),
            FileKind::Vnode { vnode, .. } => {
                if vnode.is_dir() {
                    return Err(KernelError::IsADirectory);
                }
                let mut off = self.offset.lock();
                let size = vnode.size();
                if *off >= size {
                    return Ok(0);
                }
                let n = buf.len().min((size - *off) as usize);
                let dst = &mut buf[..n];

                if !vfs.readahead().try_read(self.id, *off, dst) {
                    let got = vfs.cache().read(vnode.dev, vnode.inum, *off, dst)?;
                    debug_assert_eq!(got, n);
                    if n >= RATHRESHOLD {
                        vfs.readahead()
                            .populate(self.id, vnode.dev, vnode.inum, *off, dst);
                    }
                }
                *off += n as u64;
                Ok(n)
            }
        }
    }

    /// Writes `buf` at the handle offset (end of file with O_APPEND),
    /// growing the file through the driver before the bytes land in the
    /// page cache.
    pub fn write(&self, vfs: &Vfs, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(KernelError::BadFd);
        }
        match &self.kind {
            FileKind::Console => {
                console::write(buf);
                Ok(buf.len())
            }
            FileKind::Pipe { pipe } => pipe.write(buf),
            FileKind::Vnode { fs, vnode } => {
                let mut off = self.offset.lock();
                if self.append {
                    *off = vnode.size();
                }
                fs.prepare_write(vnode, *off, buf.len())?;
                let n = vfs.cache().write(vnode.dev, vnode.inum, *off, buf)?;
                vfs.readahead().invalidate_file(vnode.dev, vnode.inum);
                *off += n as u64;
                Ok(n)
            }
        }
    }

    /// Repositions the handle offset. Only filesystem objects seek.
    pub fn lseek(&self, offset: i64, whence: u32) -> Result<u64> {
        let vnode = match &self.kind {
            FileKind::Vnode { vnode, .. } => vnode,
            _ => return Err(KernelError::InvalidArgument),
        };
        let mut off = self.offset.lock();
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => *off as i64,
            SEEK_END => vnode.size() as i64,
            _ => return Err(KernelError::InvalidArgument),
        };
        let target = base.checked_add(offset).ok_or(KernelError::InvalidArgument)?;
        if target < 0 {
            return Err(KernelError::InvalidArgument);
        }
        *off = target as u64;
        Ok(*off)
    }

    pub fn stat(&self) -> Result<Stat> {
        match &self.kind {
            FileKind::Vnode { vnode, .. } => Ok(Stat {
                dev: vnode.dev,
                inum: vnode.inum,
                kind: vnode.kind,
                size: vnode.size(),
            }),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub fn vnode(&self) -> Option<&Arc<Vnode>> {
        match &self.kind {
            FileKind::Vnode { vnode, .. } => Some(vnode),
            _ => None,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // The last handle on a pipe end closes that side.
        if let FileKind::Pipe { pipe } = &self.kind {
            pipe.close_end(self.writable);
        }
    }
}

/// System-wide pool of open-file objects.
pub struct FileTable {
    slots: SpinLock<Vec<Weak<File>>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: SpinLock::new("file table", Vec::new()),
        }
    }

    /// Allocates a file object, failing when NFILE are already live.
    pub fn alloc(
        &self,
        kind: FileKind,
        readable: bool,
        writable: bool,
        append: bool,
    ) -> Result<RcFile> {
        let mut slots = self.slots.lock();
        slots.retain(|w| w.strong_count() > 0);
        if slots.len() >= NFILE {
            return Err(KernelError::TooManyFiles);
        }
        let file = Arc::new(File::new(kind, readable, writable, append));
        slots.push(Arc::downgrade(&file));
        Ok(file)
    }

    /// Opens `path` through the VFS into a pooled file object, applying
    /// the cache invalidation O_TRUNC implies.
    pub fn open_path(&self, vfs: &Vfs, path: &crate::fs::Path, flags: OpenFlags) -> Result<RcFile> {
        let (fs, vnode) = vfs.open(path, flags)?;
        if flags.contains(OpenFlags::O_TRUNC) && flags.writable() {
            let _ = vfs.cache().invalidate_file(vnode.dev, vnode.inum);
            vfs.readahead().invalidate_file(vnode.dev, vnode.inum);
        }
        self.alloc(
            FileKind::Vnode { fs, vnode },
            flags.readable(),
            flags.writable(),
            flags.contains(OpenFlags::O_APPEND),
        )
    }

    /// Unlinks, dropping cached pages of the dead file first.
    pub fn unlink_path(&self, vfs: &Vfs, path: &crate::fs::Path) -> Result<()> {
        let fs = vfs.root_mount()?;
        if let Ok(vnode) = fs.lookup(path) {
            let _ = vfs.cache().invalidate_file(vnode.dev, vnode.inum);
            vfs.readahead().invalidate_file(vnode.dev, vnode.inum);
        }
        fs.unlink(path)
    }

    pub fn live(&self) -> usize {
        let mut slots = self.slots.lock();
        slots.retain(|w| w.strong_count() > 0);
        slots.len()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
