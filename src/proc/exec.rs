//! Program loading.
//!
//! Userland images are flat binaries: the whole file maps at the fixed
//! load base and execution starts there. exec builds the new address
//! space and argument stack first, then swaps them in, so a failing
//! exec leaves the caller untouched.

use arrayvec::ArrayVec;

use crate::arch::TrapFrame;
use crate::error::{KernelError, Result};
use crate::fs::{Path, Vfs, VnodeKind};
use crate::param::{MAXARG, PGSIZE, USER_CODE_BASE, USTACKPAGES, USTACKTOP};
use crate::vm::{AddressSpace, RegionKind, RegionPerm};

use super::RcProc;

/// Upper bound on image size; anything bigger is not a program.
const MAX_IMAGE: u64 = 16 * 1024 * 1024;

/// Reads `path` into a fresh address space with a stack reservation.
/// Returns the space, the entry point, and the stack top.
pub fn load_image(vfs: &Vfs, path: &Path) -> Result<(AddressSpace, usize, usize)> {
    let (_fs, vnode) = vfs.lookup(path)?;
    if vnode.kind != VnodeKind::File {
        return Err(KernelError::IsADirectory);
    }
    let size = vnode.size();
    if size == 0 || size > MAX_IMAGE {
        return Err(KernelError::InvalidArgument);
    }

    let mut aspace = AddressSpace::new()?;
    aspace.populate(
        USER_CODE_BASE,
        size as usize,
        RegionPerm::READ | RegionPerm::WRITE | RegionPerm::EXEC,
        RegionKind::Code,
        None,
    )?;

    let mut off = 0u64;
    let mut chunk = [0u8; PGSIZE];
    while off < size {
        let n = ((size - off) as usize).min(PGSIZE);
        let got = vfs
            .cache()
            .read(vnode.dev, vnode.inum, off, &mut chunk[..n])?;
        if got != n {
            return Err(KernelError::Io);
        }
        aspace.write_bytes(USER_CODE_BASE + off as usize, &chunk[..n])?;
        off += n as u64;
    }

    let ustack_top = aspace.setup_stack()?;
    Ok((aspace, USER_CODE_BASE, ustack_top))
}

/// Lays out `argv` on the user stack: the strings, a NULL-terminated
/// pointer array, then `argv` and `argc` on top, which is the entry
/// ABI. Returns the initial user ESP.
pub fn setup_user_stack(
    aspace: &mut AddressSpace,
    ustack_top: usize,
    args: &[&[u8]],
) -> Result<usize> {
    if args.len() > MAXARG {
        return Err(KernelError::InvalidArgument);
    }
    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    let need = strings + (args.len() + 3) * 4 + 4;
    if need > USTACKPAGES * PGSIZE {
        return Err(KernelError::InvalidArgument);
    }
    // Make sure the touched stack pages exist before writing.
    let mut page = (ustack_top - need) / PGSIZE * PGSIZE;
    while page < ustack_top {
        aspace.map_page(page)?;
        page += PGSIZE;
    }

    let mut sp = ustack_top;
    let mut addrs: ArrayVec<usize, MAXARG> = ArrayVec::new();
    for arg in args {
        sp -= arg.len() + 1;
        aspace.write_bytes(sp, arg)?;
        aspace.write_bytes(sp + arg.len(), &[0])?;
        let _ = addrs.try_push(sp);
    }
    sp &= !3;

    let mut push = |aspace: &mut AddressSpace, sp: &mut usize, word: u32| -> Result<()> {
        *sp -= 4;
        aspace.write_bytes(*sp, &word.to_le_bytes())
    };

    push(aspace, &mut sp, 0)?; // argv terminator
    for &addr in addrs.iter().rev() {
        push(aspace, &mut sp, addr as u32)?;
    }
    let argv_base = sp;
    push(aspace, &mut sp, argv_base as u32)?;
    push(aspace, &mut sp, args.len() as u32)?;
    Ok(sp)
}

/// Replaces the calling process's image. On success the trap frame is
/// redirected to the new entry; on failure everything stays as it was.
///
/// Must be called by the task running as `proc`.
pub fn exec_current(
    proc: &RcProc,
    vfs: &Vfs,
    tf: &mut TrapFrame,
    path: &Path,
    args: &[&[u8]],
) -> Result<()> {
    let (mut aspace, entry, ustack_top) = load_image(vfs, path)?;
    let esp = setup_user_stack(&mut aspace, ustack_top, args)?;

    // SAFETY: per the contract, we are this process's task.
    let data = unsafe { proc.data_mut() };
    data.aspace = aspace;
    data.entry = entry;
    data.ustack_top = ustack_top;

    tf.eip = entry as u32;
    tf.useresp = esp as u32;

    if let Some((_, name)) = path.split_parent() {
        proc.set_name(name.as_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_stack_matches_the_entry_abi() {
        let mut aspace = AddressSpace::new().unwrap();
        let top = aspace.setup_stack().unwrap();
        let esp = setup_user_stack(&mut aspace, top, &[b"sh", b"-c", b"ls"]).unwrap();
        assert_eq!(esp % 4, 0);

        let mut word = [0u8; 4];
        aspace.read_bytes(esp, &mut word).unwrap();
        let argc = u32::from_le_bytes(word);
        assert_eq!(argc, 3);

        aspace.read_bytes(esp + 4, &mut word).unwrap();
        let argv = u32::from_le_bytes(word) as usize;
        for (i, expect) in [&b"sh"[..], b"-c", b"ls"].iter().enumerate() {
            aspace.read_bytes(argv + 4 * i, &mut word).unwrap();
            let ptr = u32::from_le_bytes(word) as usize;
            let mut s = vec![0u8; expect.len() + 1];
            aspace.read_bytes(ptr, &mut s).unwrap();
            assert_eq!(&s[..expect.len()], *expect);
            assert_eq!(s[expect.len()], 0);
        }
        // argv is NULL terminated.
        aspace.read_bytes(argv + 12, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 0);
    }
}
