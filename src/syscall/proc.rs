//! Process system calls.

use alloc::vec::Vec;

use arrayvec::ArrayVec;

use crate::arch::TrapFrame;
use crate::error::{KernelError, Result};
use crate::fs::Path;
use crate::kernel::kernel;
use crate::param::{MAXARG, MAXPATH};
use crate::proc::RcProc;
use crate::uaccess;

pub(super) fn sys_exit(proc: &RcProc, status: i32) -> Result<usize> {
    let k = kernel();
    k.procs.exit(&k.sched, proc, status);
    // On the kernel build this never returns; the task switches away as
    // a zombie. The value below is for the host harness only.
    k.deschedule_current();
    Ok(0)
}

pub(super) fn sys_fork(proc: &RcProc, tf: &TrapFrame) -> Result<usize> {
    let k = kernel();
    // The child resumes from this syscall frame; make sure the copy on
    // the kernel stack is current before it is duplicated.
    // SAFETY: we are this process's task.
    unsafe {
        *proc.data().kstack.trap_frame_ptr() = *tf;
    }
    let pid = k.procs.fork(&k.sched, proc)?;
    Ok(pid as usize)
}

pub(super) fn sys_waitpid(
    proc: &RcProc,
    pid: i32,
    user_status: usize,
    options: u32,
) -> Result<usize> {
    let k = kernel();
    let (child, status) = k.procs.waitpid(&k.sched, proc, pid, options)?;
    if user_status != 0 {
        // SAFETY: we are this process's task.
        let data = unsafe { proc.data_mut() };
        uaccess::try_copy_to_user(&mut data.aspace, user_status, &status.to_le_bytes())?;
    }
    Ok(child as usize)
}

pub(super) fn sys_getpid(proc: &RcProc) -> Result<usize> {
    Ok(proc.pid as usize)
}

pub(super) fn sys_getppid(proc: &RcProc) -> Result<usize> {
    Ok(proc.ppid() as usize)
}

pub(super) fn sys_kill(proc: &RcProc, pid: i32, sig: u32) -> Result<usize> {
    let k = kernel();
    if pid > 0 {
        k.procs.kill(&k.sched, pid, sig)?;
    } else {
        // 0: the caller's group; negative: the group -pid.
        let pgid = if pid == 0 {
            proc.info.lock().pgid
        } else {
            -pid
        };
        let _ = k.procs.signal_group(&k.sched, pgid, sig)?;
    }
    Ok(0)
}

pub(super) fn sys_signal(proc: &RcProc, sig: u32, handler: usize) -> Result<usize> {
    let old = proc.sig.lock().set_handler(sig, handler)?;
    Ok(old)
}

pub(super) fn sys_execve(
    proc: &RcProc,
    tf: &mut TrapFrame,
    user_path: usize,
    user_argv: usize,
    _user_envp: usize,
) -> Result<usize> {
    let k = kernel();
    let path = super::file::absolute_path(proc, user_path)?;

    // Stage the argument strings in kernel memory before anything of
    // the old image goes away.
    // SAFETY: we are this process's task.
    let data = unsafe { proc.data() };
    let mut args: Vec<Vec<u8>> = Vec::new();
    if user_argv != 0 {
        for i in 0..MAXARG {
            let mut word = [0u8; 4];
            uaccess::try_copy_from_user(&data.aspace, &mut word, user_argv + 4 * i)?;
            let ptr = u32::from_le_bytes(word) as usize;
            if ptr == 0 {
                break;
            }
            let mut buf = [0u8; MAXPATH];
            let len = uaccess::strncpy_from_user(&data.aspace, &mut buf, ptr)?;
            args.push(buf[..len].to_vec());
        }
    }
    let arg_slices: ArrayVec<&[u8], MAXARG> = args.iter().map(|a| a.as_slice()).collect();

    crate::proc::exec::exec_current(proc, &k.vfs, tf, Path::new(&path), &arg_slices)?;
    // The return value lands in the new image's eax; zero by
    // convention (the real entry reads argc from the stack).
    Ok(0)
}
