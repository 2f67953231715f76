//! File-system system calls.
//!
//! Mostly argument checking and user-memory framing, since user code is
//! untrusted; the work happens in `file`, `fs`, and the page cache.
//! Long read/write transfers are chunked through a bounded kernel
//! bounce buffer so one call cannot pin arbitrary kernel memory.

use alloc::vec;

use arrayvec::ArrayVec;

use crate::console;
use crate::error::{KernelError, Result};
use crate::fs::{OpenFlags, Path};
use crate::kernel::kernel;
use crate::param::{BOUNCE_SIZE, MAXPATH};
use crate::pipe;
use crate::proc::RcProc;
use crate::uaccess::{self, AccessKind};

/// Builds an absolute kernel-side path from a user pointer, joining
/// relative paths onto the process's working directory.
pub(super) fn absolute_path(proc: &RcProc, user_path: usize) -> Result<ArrayVec<u8, MAXPATH>> {
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data() };
    let (buf, len) = uaccess::fetch_path(&data.aspace, user_path)?;
    let rel = &buf[..len];
    let mut out: ArrayVec<u8, MAXPATH> = ArrayVec::new();
    if rel.first() != Some(&b'/') {
        out.try_extend_from_slice(&data.cwd)
            .map_err(|_| KernelError::NameTooLong)?;
        if out.last() != Some(&b'/') {
            out.try_push(b'/').map_err(|_| KernelError::NameTooLong)?;
        }
    }
    out.try_extend_from_slice(rel)
        .map_err(|_| KernelError::NameTooLong)?;
    if out.is_empty() {
        return Err(KernelError::NotFound);
    }
    Ok(out)
}

pub(super) fn sys_open(proc: &RcProc, user_path: usize, flags: u32, _mode: u32) -> Result<usize> {
    let k = kernel();
    let path = absolute_path(proc, user_path)?;
    let flags = OpenFlags::from_bits_truncate(flags);
    let file = k.ftable.open_path(&k.vfs, Path::new(&path), flags)?;
    let fd = proc.files.lock().alloc(file)?;
    Ok(fd as usize)
}

pub(super) fn sys_close(proc: &RcProc, fd: i32) -> Result<usize> {
    proc.files.lock().close(fd)?;
    Ok(0)
}

pub(super) fn sys_read(proc: &RcProc, fd: i32, user_buf: usize, n: usize) -> Result<usize> {
    let k = kernel();
    let file = proc.files.lock().get(fd)?;
    if n == 0 {
        return Ok(0);
    }
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data_mut() };
    if !uaccess::access_ok(&data.aspace, AccessKind::Write, user_buf, n) {
        return Err(KernelError::BadAddress);
    }

    let mut bounce = vec![0u8; BOUNCE_SIZE.min(n)];
    let mut done = 0;
    while done < n {
        let want = (n - done).min(bounce.len());
        let got = file.read(&k.vfs, &mut bounce[..want])?;
        if got == 0 {
            break;
        }
        uaccess::try_copy_to_user(&mut data.aspace, user_buf + done, &bounce[..got])?;
        done += got;
        if got < want {
            break;
        }
    }
    Ok(done)
}

pub(super) fn sys_write(proc: &RcProc, fd: i32, user_buf: usize, n: usize) -> Result<usize> {
    let k = kernel();
    let file = proc.files.lock().get(fd)?;
    if n == 0 {
        return Ok(0);
    }
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data() };
    // Validate before any byte reaches the file or device.
    if !uaccess::access_ok(&data.aspace, AccessKind::Read, user_buf, n) {
        return Err(KernelError::BadAddress);
    }

    let mut bounce = vec![0u8; BOUNCE_SIZE.min(n)];
    let mut done = 0;
    while done < n {
        let want = (n - done).min(bounce.len());
        uaccess::try_copy_from_user(&data.aspace, &mut bounce[..want], user_buf + done)?;
        let put = file.write(&k.vfs, &bounce[..want])?;
        done += put;
        if put < want {
            break;
        }
    }
    Ok(done)
}

pub(super) fn sys_lseek(proc: &RcProc, fd: i32, offset: i32, whence: u32) -> Result<usize> {
    let file = proc.files.lock().get(fd)?;
    let pos = file.lseek(offset as i64, whence)?;
    Ok(pos as usize)
}

pub(super) fn sys_dup2(proc: &RcProc, oldfd: i32, newfd: i32) -> Result<usize> {
    let mut files = proc.files.lock();
    let file = files.get(oldfd)?;
    if oldfd != newfd {
        files.install(newfd, file)?;
    }
    Ok(newfd as usize)
}

pub(super) fn sys_pipe(proc: &RcProc, user_fds: usize) -> Result<usize> {
    let k = kernel();
    let (reader, writer) = pipe::alloc_pair(&k.ftable)?;
    let (fd0, fd1) = {
        let mut files = proc.files.lock();
        let fd0 = files.alloc(reader)?;
        match files.alloc(writer) {
            Ok(fd1) => (fd0, fd1),
            Err(e) => {
                let _ = files.close(fd0);
                return Err(e);
            }
        }
    };
    let words = [fd0 as u32, fd1 as u32];
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&words[0].to_le_bytes());
    bytes[4..].copy_from_slice(&words[1].to_le_bytes());
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data_mut() };
    if uaccess::try_copy_to_user(&mut data.aspace, user_fds, &bytes).is_err() {
        let mut files = proc.files.lock();
        let _ = files.close(fd0);
        let _ = files.close(fd1);
        return Err(KernelError::BadAddress);
    }
    Ok(0)
}

pub(super) fn sys_puts(proc: &RcProc, user_str: usize) -> Result<usize> {
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data() };
    let mut buf = vec![0u8; BOUNCE_SIZE];
    let len = uaccess::strncpy_from_user(&data.aspace, &mut buf, user_str)?;
    console::write(&buf[..len]);
    console::write(b"\n");
    Ok(len)
}

pub(super) fn sys_read_terminal_line(proc: &RcProc, user_buf: usize, n: usize) -> Result<usize> {
    if n == 0 {
        return Ok(0);
    }
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data_mut() };
    if !uaccess::access_ok(&data.aspace, AccessKind::Write, user_buf, n) {
        return Err(KernelError::BadAddress);
    }
    let mut bounce = vec![0u8; BOUNCE_SIZE.min(n)];
    let got = console::read_line(&mut bounce);
    uaccess::try_copy_to_user(&mut data.aspace, user_buf, &bounce[..got])?;
    Ok(got)
}

pub(super) fn sys_chdir(proc: &RcProc, user_path: usize) -> Result<usize> {
    let k = kernel();
    let path = absolute_path(proc, user_path)?;
    let (_, vnode) = k.vfs.lookup(Path::new(&path))?;
    if !vnode.is_dir() {
        return Err(KernelError::NotADirectory);
    }
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data_mut() };
    data.cwd.clear();
    data.cwd
        .try_extend_from_slice(&path)
        .map_err(|_| KernelError::NameTooLong)?;
    Ok(0)
}

pub(super) fn sys_getcwd(proc: &RcProc, user_buf: usize, size: usize) -> Result<usize> {
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data_mut() };
    let cwd_len = data.cwd.len();
    if size < cwd_len + 1 {
        return Err(KernelError::InvalidArgument);
    }
    let mut out: ArrayVec<u8, { MAXPATH + 1 }> = ArrayVec::new();
    let _ = out.try_extend_from_slice(&data.cwd);
    let _ = out.try_push(0);
    uaccess::try_copy_to_user(&mut data.aspace, user_buf, &out)?;
    Ok(cwd_len)
}
