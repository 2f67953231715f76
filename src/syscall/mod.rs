//! System call dispatch.
//!
//! The dispatcher reads the number and three argument words from the
//! saved register frame, runs the table entry, and writes the result
//! back: non-negative on success, negative errno on failure,
//! `-ENOSYS` for numbers nobody claims.

mod file;
mod proc;

use crate::arch::TrapFrame;
use crate::error::{KernelError, Result};
use crate::proc::RcProc;

pub const SYS_EXIT: u32 = 1;
pub const SYS_FORK: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_WRITE: u32 = 4;
pub const SYS_OPEN: u32 = 5;
pub const SYS_CLOSE: u32 = 6;
pub const SYS_PUTS: u32 = 7;
pub const SYS_EXECVE: u32 = 8;
pub const SYS_CHDIR: u32 = 9;
pub const SYS_WAITPID: u32 = 10;
pub const SYS_LSEEK: u32 = 11;
pub const SYS_GETPID: u32 = 12;
pub const SYS_READ_TERMINAL_LINE: u32 = 13;
pub const SYS_DUP2: u32 = 14;
pub const SYS_KILL: u32 = 15;
pub const SYS_PIPE: u32 = 16;
pub const SYS_SIGNAL: u32 = 17;
pub const SYS_GETPPID: u32 = 18;
pub const SYS_GETCWD: u32 = 19;

/// Dispatches the call in `tf` on behalf of `proc` and stores the
/// return value into the frame.
pub fn dispatch(proc: &RcProc, tf: &mut TrapFrame) {
    let num = tf.syscall_num();
    let (a1, a2, a3) = tf.syscall_args();
    let result: Result<usize> = match num {
        SYS_EXIT => proc::sys_exit(proc, a1 as i32),
        SYS_FORK => proc::sys_fork(proc, tf),
        SYS_READ => file::sys_read(proc, a1 as i32, a2 as usize, a3 as usize),
        SYS_WRITE => file::sys_write(proc, a1 as i32, a2 as usize, a3 as usize),
        SYS_OPEN => file::sys_open(proc, a1 as usize, a2, a3),
        SYS_CLOSE => file::sys_close(proc, a1 as i32),
        SYS_PUTS => file::sys_puts(proc, a1 as usize),
        SYS_EXECVE => proc::sys_execve(proc, tf, a1 as usize, a2 as usize, a3 as usize),
        SYS_CHDIR => file::sys_chdir(proc, a1 as usize),
        SYS_WAITPID => proc::sys_waitpid(proc, a1 as i32, a2 as usize, a3),
        SYS_LSEEK => file::sys_lseek(proc, a1 as i32, a2 as i32, a3),
        SYS_GETPID => proc::sys_getpid(proc),
        SYS_READ_TERMINAL_LINE => file::sys_read_terminal_line(proc, a1 as usize, a2 as usize),
        SYS_DUP2 => file::sys_dup2(proc, a1 as i32, a2 as i32),
        SYS_KILL => proc::sys_kill(proc, a1 as i32, a2),
        SYS_PIPE => file::sys_pipe(proc, a1 as usize),
        SYS_SIGNAL => proc::sys_signal(proc, a1, a2 as usize),
        SYS_GETPPID => proc::sys_getppid(proc),
        SYS_GETCWD => file::sys_getcwd(proc, a1 as usize, a2 as usize),
        _ => Err(KernelError::NotSupported),
    };
    match result {
        Ok(value) => tf.set_ret(value as isize),
        Err(e) => tf.set_ret(e.to_ret()),
    }
}
