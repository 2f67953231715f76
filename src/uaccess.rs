//! User memory access primitives.
//!
//! All kernel reads and writes of user memory funnel through here. A
//! range is validated against the process's regions before any byte
//! moves, and the copy loop consults the frame map page by page, so a
//! hole in the middle of a validated range surfaces as a short copy
//! rather than a kernel fault. The copies report the number of bytes
//! *not* copied, zero meaning success, which is what lets a faulting
//! copy signal an error instead of killing the process.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{KernelError, Result};
use crate::param::MAXPATH;
use crate::vm::AddressSpace;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// True while a user-access primitive is running; the kernel page-fault
/// path treats a fault under this flag as a failed copy, not a panic.
static IN_UACCESS: AtomicBool = AtomicBool::new(false);

struct UaccessWindow;

impl UaccessWindow {
    fn enter() -> Self {
        IN_UACCESS.store(true, Ordering::Relaxed);
        UaccessWindow
    }
}

impl Drop for UaccessWindow {
    fn drop(&mut self) {
        IN_UACCESS.store(false, Ordering::Relaxed);
    }
}

/// Whether the fault landing pad is armed.
pub fn in_user_access() -> bool {
    IN_UACCESS.load(Ordering::Relaxed)
}

/// Checks that `[ptr, ptr + n)` is strictly below the kernel split and
/// readable or writable per the process's memory regions.
pub fn access_ok(aspace: &AddressSpace, kind: AccessKind, ptr: usize, n: usize) -> bool {
    aspace.check_range(ptr, n, kind == AccessKind::Write)
}

/// Copies `dst.len()` bytes from user `src`. Returns the number of bytes
/// not copied; zero on success. No user memory is read when the range
/// fails validation.
pub fn copy_from_user(aspace: &AddressSpace, dst: &mut [u8], src: usize) -> usize {
    if !access_ok(aspace, AccessKind::Read, src, dst.len()) {
        return dst.len();
    }
    let _window = UaccessWindow::enter();
    let mut done = 0;
    while done < dst.len() {
        match aspace.frame_of(src + done) {
            Some((frame, off)) => {
                let n = (crate::param::PGSIZE - off).min(dst.len() - done);
                dst[done..done + n].copy_from_slice(&frame.as_slice()[off..off + n]);
                done += n;
            }
            None => break,
        }
    }
    dst.len() - done
}

/// Copies `src.len()` bytes to user `dst`. Returns the number of bytes
/// not copied; zero on success.
pub fn copy_to_user(aspace: &mut AddressSpace, dst: usize, src: &[u8]) -> usize {
    if !access_ok(aspace, AccessKind::Write, dst, src.len()) {
        return src.len();
    }
    let _window = UaccessWindow::enter();
    let mut done = 0;
    while done < src.len() {
        match aspace.frame_of_mut(dst + done) {
            Some((frame, off)) => {
                let n = (crate::param::PGSIZE - off).min(src.len() - done);
                frame.as_mut_slice()[off..off + n].copy_from_slice(&src[done..done + n]);
                done += n;
            }
            None => break,
        }
    }
    src.len() - done
}

/// Copy wrappers that turn a short copy into `BadAddress`.
pub fn try_copy_from_user(aspace: &AddressSpace, dst: &mut [u8], src: usize) -> Result<()> {
    if copy_from_user(aspace, dst, src) != 0 {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

pub fn try_copy_to_user(aspace: &mut AddressSpace, dst: usize, src: &[u8]) -> Result<()> {
    if copy_to_user(aspace, dst, src) != 0 {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

/// Copies a NUL-terminated string from user space into `buf`, stopping
/// at the terminator. Returns the string length (without the NUL).
/// A string longer than `buf` is `NameTooLong`; an unreadable byte
/// before the terminator is `BadAddress`.
pub fn strncpy_from_user(aspace: &AddressSpace, buf: &mut [u8], mut src: usize) -> Result<usize> {
    let _window = UaccessWindow::enter();
    let mut len = 0;
    loop {
        if len == buf.len() {
            return Err(KernelError::NameTooLong);
        }
        if !access_ok(aspace, AccessKind::Read, src, 1) {
            return Err(KernelError::BadAddress);
        }
        let (frame, off) = aspace.frame_of(src).ok_or(KernelError::BadAddress)?;
        let byte = frame.as_slice()[off];
        if byte == 0 {
            return Ok(len);
        }
        buf[len] = byte;
        len += 1;
        src += 1;
    }
}

/// Fetches a user path into a fixed kernel buffer.
pub fn fetch_path(aspace: &AddressSpace, src: usize) -> Result<([u8; MAXPATH], usize)> {
    let mut buf = [0u8; MAXPATH];
    let len = strncpy_from_user(aspace, &mut buf, src)?;
    Ok((buf, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{KERNBASE, PGSIZE};
    use crate::vm::{RegionKind, RegionPerm};

    fn aspace() -> AddressSpace {
        let mut a = AddressSpace::new().unwrap();
        a.populate(
            0x40_0000,
            PGSIZE,
            RegionPerm::READ | RegionPerm::WRITE,
            RegionKind::Data,
            None,
        )
        .unwrap();
        a
    }

    #[test]
    fn copies_crossing_into_the_kernel_window_fail_whole() {
        let mut a = aspace();
        let mut dst = [0xAAu8; 16];
        assert_eq!(copy_from_user(&a, &mut dst, KERNBASE - 8), 16);
        // Nothing was read into the buffer.
        assert!(dst.iter().all(|&b| b == 0xAA));
        assert_eq!(copy_to_user(&mut a, KERNBASE - 8, &[1; 16]), 16);
    }

    #[test]
    fn null_pointer_ranges_fail_validation() {
        let a = aspace();
        let mut dst = [0u8; 10];
        assert_eq!(copy_from_user(&a, &mut dst, 0), 10);
        assert!(!access_ok(&a, AccessKind::Write, 0, 10));
    }

    #[test]
    fn successful_copies_return_zero_remaining() {
        let mut a = aspace();
        assert_eq!(copy_to_user(&mut a, 0x40_0000, b"hello"), 0);
        let mut out = [0u8; 5];
        assert_eq!(copy_from_user(&a, &mut out, 0x40_0000), 0);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn strings_respect_the_terminator_and_the_limit() {
        let mut a = aspace();
        a.write_bytes(0x40_0000, b"abc\0def").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(strncpy_from_user(&a, &mut buf, 0x40_0000), Ok(3));
        assert_eq!(&buf[..3], b"abc");

        let mut tiny = [0u8; 2];
        assert_eq!(
            strncpy_from_user(&a, &mut tiny, 0x40_0000),
            Err(KernelError::NameTooLong)
        );
    }
}
