//! Syscall-boundary and process-lifecycle behavior against the full
//! kernel singleton: a FAT root, real processes with address spaces,
//! and the register-frame dispatch path.

mod common;

use coal_kernel::arch::TrapFrame;
use coal_kernel::error::KernelError;
use coal_kernel::file::{SEEK_SET};
use coal_kernel::fs::{OpenFlags, Path};
use coal_kernel::kernel::{self, Kernel};
use coal_kernel::proc::table::DEFAULT_PRIO;
use coal_kernel::proc::{ProcState, RcProc, SIGKILL};
use coal_kernel::syscall::{self, *};
use coal_kernel::trap;
use coal_kernel::param::USER_CODE_BASE;

use std::sync::Once;

fn p(s: &str) -> &Path {
    Path::new(s.as_bytes())
}

fn setup() -> &'static Kernel {
    static INIT: Once = Once::new();
    let k = kernel::init_kernel();
    INIT.call_once(|| {
        let (_disk, dev) = common::fat16_disk("sysroot");
        k.mount_root(dev).unwrap();
        let root = k.vfs.root_mount().unwrap();
        root.mkdir(p("/bin")).unwrap();
        let f = k
            .ftable
            .open_path(
                &k.vfs,
                p("/bin/init"),
                OpenFlags::O_CREAT | OpenFlags::O_RDWR,
            )
            .unwrap();
        f.write(&k.vfs, &[0x90u8; 64]).unwrap();
    });
    k
}

fn user_proc(k: &Kernel) -> RcProc {
    let pid = k.spawn(p("/bin/init"), DEFAULT_PRIO).unwrap();
    k.procs.get(pid).unwrap()
}

/// Drives one syscall through the dispatcher the way the trap path
/// does: number and arguments in the registers, result read back from
/// eax.
fn call(proc: &RcProc, num: u32, a1: u32, a2: u32, a3: u32) -> i32 {
    let mut tf = TrapFrame::default();
    tf.eax = num;
    tf.ebx = a1;
    tf.ecx = a2;
    tf.edx = a3;
    syscall::dispatch(proc, &mut tf);
    tf.eax as i32
}

/// Writes bytes into the process's user memory.
fn poke(proc: &RcProc, va: usize, bytes: &[u8]) {
    // SAFETY: the process is not running; the test is its only driver.
    let data = unsafe { proc.data_mut() };
    data.aspace.write_bytes(va, bytes).unwrap();
}

fn peek(proc: &RcProc, va: usize, len: usize) -> Vec<u8> {
    // SAFETY: as above.
    let data = unsafe { proc.data() };
    let mut out = vec![0u8; len];
    data.aspace.read_bytes(va, &mut out).unwrap();
    out
}

#[test]
fn s6_write_validates_before_touching_anything() {
    let k = setup();
    let proc = user_proc(k);
    // write(1, NULL, 10) faults without writing a byte.
    assert_eq!(call(&proc, SYS_WRITE, 1, 0, 10), -14);
    // write(1, buf, 0) is a successful no-op.
    assert_eq!(call(&proc, SYS_WRITE, 1, USER_CODE_BASE as u32, 0), 0);
    // A range that leaks into the kernel window faults too.
    assert_eq!(
        call(&proc, SYS_WRITE, 1, (0xC000_0000u32).wrapping_sub(4), 64),
        -14
    );
}

#[test]
fn open_gets_fd_three_then_write_seek_read_round_trips() {
    let k = setup();
    let proc = user_proc(k);
    let path_va = USER_CODE_BASE;
    let data_va = USER_CODE_BASE + 128;
    let read_va = USER_CODE_BASE + 256;
    poke(&proc, path_va, b"/rt.txt\0");

    let fd = call(
        &proc,
        SYS_OPEN,
        path_va as u32,
        (OpenFlags::O_CREAT | OpenFlags::O_RDWR).bits(),
        0o644,
    );
    assert!(fd >= 3, "first real descriptor after the standard streams");

    poke(&proc, data_va, b"hi");
    assert_eq!(call(&proc, SYS_WRITE, fd as u32, data_va as u32, 2), 2);
    assert_eq!(call(&proc, SYS_LSEEK, fd as u32, 0, SEEK_SET), 0);
    assert_eq!(call(&proc, SYS_READ, fd as u32, read_va as u32, 8), 2);
    assert_eq!(peek(&proc, read_va, 2), b"hi");
}

#[test]
fn descriptors_are_idempotent_across_close_and_reuse() {
    let k = setup();
    let proc = user_proc(k);
    poke(&proc, USER_CODE_BASE, b"/fd.txt\0");
    let open = |proc: &RcProc| {
        call(
            proc,
            SYS_OPEN,
            USER_CODE_BASE as u32,
            (OpenFlags::O_CREAT | OpenFlags::O_RDWR).bits(),
            0,
        )
    };
    let fd = open(&proc);
    assert!(fd >= 3);
    assert_eq!(call(&proc, SYS_CLOSE, fd as u32, 0, 0), 0);
    // A closed descriptor is EBADF for everything.
    assert_eq!(call(&proc, SYS_READ, fd as u32, USER_CODE_BASE as u32, 4), -9);
    assert_eq!(call(&proc, SYS_CLOSE, fd as u32, 0, 0), -9);
    // And the number is handed out again.
    assert_eq!(open(&proc), fd);
}

#[test]
fn fork_copies_memory_and_shares_open_files() {
    let k = setup();
    let parent = user_proc(k);
    poke(&parent, USER_CODE_BASE, b"marker");

    let child_pid = call(&parent, SYS_FORK, 0, 0, 0);
    assert!(child_pid > parent.pid);
    let child = k.procs.get(child_pid).unwrap();
    assert_eq!(child.state(), ProcState::Ready);
    assert_eq!(child.ppid(), parent.pid);

    // Same bytes, different frames.
    assert_eq!(peek(&child, USER_CODE_BASE, 6), b"marker");
    poke(&child, USER_CODE_BASE, b"CHILD!");
    assert_eq!(peek(&parent, USER_CODE_BASE, 6), b"marker");

    // The standard streams are the same open-file objects.
    let pf = parent.files.lock().get(1).unwrap();
    let cf = child.files.lock().get(1).unwrap();
    assert!(std::sync::Arc::ptr_eq(&pf, &cf));

    // The child resumed from the fork frame with a zero return value.
    // SAFETY: the child is not running.
    let child_eax = unsafe { (*child.data().kstack.trap_frame_ptr()).eax };
    assert_eq!(child_eax, 0);
}

#[test]
fn zombie_child_is_reaped_by_waitpid_with_its_status() {
    let k = setup();
    let parent = user_proc(k);
    let child_pid = call(&parent, SYS_FORK, 0, 0, 0);
    let child = k.procs.get(child_pid).unwrap();

    k.procs.exit(&k.sched, &child, 42);
    assert_eq!(child.state(), ProcState::Zombie);
    assert!(k.procs.get(child_pid).is_some(), "zombie stays addressable");

    let status_va = USER_CODE_BASE + 512;
    let reaped = call(&parent, SYS_WAITPID, -1i32 as u32, status_va as u32, 0);
    assert_eq!(reaped, child_pid);
    let status = i32::from_le_bytes(peek(&parent, status_va, 4).try_into().unwrap());
    assert_eq!(status, 42);
    assert!(k.procs.get(child_pid).is_none(), "reaped exactly once");
    assert_eq!(call(&parent, SYS_WAITPID, child_pid as u32, 0, 0), -2);
}

#[test]
fn unknown_syscall_is_enosys() {
    let k = setup();
    let proc = user_proc(k);
    assert_eq!(call(&proc, 999, 0, 0, 0), -38);
}

#[test]
fn dup2_aliases_the_open_file() {
    let k = setup();
    let proc = user_proc(k);
    assert_eq!(call(&proc, SYS_DUP2, 1, 7, 0), 7);
    let a = proc.files.lock().get(1).unwrap();
    let b = proc.files.lock().get(7).unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
    // Writing through the duplicate works like the original.
    poke(&proc, USER_CODE_BASE, b"x");
    assert_eq!(call(&proc, SYS_WRITE, 7, USER_CODE_BASE as u32, 1), 1);
}

#[test]
fn pipe_round_trips_bytes_between_descriptors() {
    let k = setup();
    let proc = user_proc(k);
    let fds_va = USER_CODE_BASE + 1024;
    assert_eq!(call(&proc, SYS_PIPE, fds_va as u32, 0, 0), 0);
    let raw = peek(&proc, fds_va, 8);
    let rfd = u32::from_le_bytes(raw[..4].try_into().unwrap());
    let wfd = u32::from_le_bytes(raw[4..].try_into().unwrap());

    let msg_va = USER_CODE_BASE + 1100;
    poke(&proc, msg_va, b"through the pipe");
    assert_eq!(call(&proc, SYS_WRITE, wfd, msg_va as u32, 16), 16);
    let out_va = USER_CODE_BASE + 1200;
    assert_eq!(call(&proc, SYS_READ, rfd, out_va as u32, 16), 16);
    assert_eq!(peek(&proc, out_va, 16), b"through the pipe");

    // Wrong directions are EBADF.
    assert_eq!(call(&proc, SYS_READ, wfd, out_va as u32, 1), -9);
    assert_eq!(call(&proc, SYS_WRITE, rfd, msg_va as u32, 1), -9);
}

#[test]
fn signal_handler_registration_and_delivery() {
    let k = setup();
    let proc = user_proc(k);
    let handler = 0x40_1000u32;
    assert_eq!(call(&proc, SYS_SIGNAL, 15, handler, 0), 0);
    // SIGKILL's disposition is not negotiable.
    assert_eq!(call(&proc, SYS_SIGNAL, SIGKILL, handler, 0), -22);

    assert_eq!(call(&proc, SYS_KILL, proc.pid as u32, 15, 0), 0);

    // On the way back to user mode the frame is redirected into the
    // handler, with the signal number and old eip on the user stack.
    let mut tf = TrapFrame::default();
    tf.eip = USER_CODE_BASE as u32;
    // SAFETY: the process is not running.
    tf.useresp = unsafe { proc.data().ustack_top } as u32;
    trap::before_user_return(&proc, &mut tf);
    assert_eq!(tf.eip, handler);
    let esp = tf.useresp as usize;
    assert_eq!(
        u32::from_le_bytes(peek(&proc, esp, 4).try_into().unwrap()),
        15
    );
    assert_eq!(
        u32::from_le_bytes(peek(&proc, esp + 4, 4).try_into().unwrap()),
        USER_CODE_BASE as u32
    );
}

#[test]
fn sigkill_ends_the_process_at_user_return() {
    let k = setup();
    let parent = user_proc(k);
    let child_pid = call(&parent, SYS_FORK, 0, 0, 0);
    let child = k.procs.get(child_pid).unwrap();

    assert_eq!(call(&parent, SYS_KILL, child_pid as u32, SIGKILL, 0), 0);
    assert!(child.killed());
    let mut tf = TrapFrame::default();
    trap::before_user_return(&child, &mut tf);
    assert_eq!(child.state(), ProcState::Zombie);
    assert_eq!(call(&parent, SYS_WAITPID, child_pid as u32, 0, 0), child_pid);
}

#[test]
fn chdir_getcwd_and_relative_paths() {
    let k = setup();
    let proc = user_proc(k);
    poke(&proc, USER_CODE_BASE, b"/bin\0");
    assert_eq!(call(&proc, SYS_CHDIR, USER_CODE_BASE as u32, 0, 0), 0);

    let buf_va = USER_CODE_BASE + 2048;
    let len = call(&proc, SYS_GETCWD, buf_va as u32, 64, 0);
    assert_eq!(len, 4);
    assert_eq!(peek(&proc, buf_va, 5), b"/bin\0");

    // A relative open resolves under the new cwd.
    poke(&proc, USER_CODE_BASE + 64, b"init\0");
    let fd = call(&proc, SYS_OPEN, (USER_CODE_BASE + 64) as u32, 0, 0);
    assert!(fd >= 3);

    // chdir to a non-directory fails.
    poke(&proc, USER_CODE_BASE + 96, b"/bin/init\0");
    assert_eq!(
        call(&proc, SYS_CHDIR, (USER_CODE_BASE + 96) as u32, 0, 0),
        KernelError::NotADirectory.to_ret() as i32
    );
}

#[test]
fn getpid_and_getppid_report_the_graph() {
    let k = setup();
    let proc = user_proc(k);
    assert_eq!(call(&proc, SYS_GETPID, 0, 0, 0), proc.pid);
    assert_eq!(call(&proc, SYS_GETPPID, 0, 0, 0), 0);
    let child_pid = call(&proc, SYS_FORK, 0, 0, 0);
    let child = k.procs.get(child_pid).unwrap();
    assert_eq!(call(&child, SYS_GETPPID, 0, 0, 0), proc.pid);
}
