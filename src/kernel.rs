//! Kernel singleton and boot wiring.
//!
//! Process-wide state lives in one `Kernel` record initialized exactly
//! once, in a fixed order: buffer cache, VFS (with its page cache),
//! file table, process table, scheduler. Nothing here is torn down
//! while the kernel is live. The context-switch glue at the bottom only
//! exists on the i686 build; the host harness drives the same
//! subsystems directly.

use alloc::sync::Arc;

use crate::bio::Bcache;
use crate::device::DeviceId;
use crate::error::{KernelError, Result};
use crate::file::{FileKind, FileTable};
use crate::fs::fat::FatDriver;
use crate::fs::{Path, Vfs};
use crate::proc::table::DEFAULT_PRIO;
use crate::proc::{Pid, ProcState, ProcTable, Process, RcProc, Scheduler};

pub struct Kernel {
    pub bcache: Arc<Bcache>,
    pub vfs: Arc<Vfs>,
    pub ftable: FileTable,
    pub procs: ProcTable,
    pub sched: Scheduler,
}

static KERNEL: spin::Once<Kernel> = spin::Once::new();

/// Builds the kernel state; callable once, further calls return the
/// existing instance.
pub fn init_kernel() -> &'static Kernel {
    KERNEL.call_once(Kernel::new)
}

/// The kernel, which must have been initialized.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel not initialized")
}

pub fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

impl Kernel {
    fn new() -> Self {
        let bcache = Arc::new(Bcache::new());
        Self {
            bcache: bcache.clone(),
            vfs: Vfs::new(),
            ftable: FileTable::new(),
            procs: ProcTable::new(),
            sched: Scheduler::new(),
        }
    }

    /// Registers the FAT driver and mounts `dev` at `/`.
    pub fn mount_root(&self, dev: DeviceId) -> Result<()> {
        match self
            .vfs
            .register_driver(Arc::new(FatDriver::new(self.bcache.clone())))
        {
            Ok(()) | Err(KernelError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
        self.vfs.mount_root("/", "fat", dev)
    }

    pub fn current_proc(&self) -> Option<RcProc> {
        self.sched.current().and_then(|pid| self.procs.get(pid))
    }

    /// Creates a user process from the program at `path`, with the
    /// standard streams wired to the console.
    pub fn spawn(&self, path: &Path, prio: u8) -> Result<Pid> {
        let (mut aspace, entry, ustack_top) =
            crate::proc::exec::load_image(&self.vfs, path)?;
        let name = path
            .split_parent()
            .map(|(_, n)| n.as_bytes())
            .unwrap_or(&b"?"[..]);
        let esp = crate::proc::exec::setup_user_stack(&mut aspace, ustack_top, &[name])?;

        let kstack = crate::proc::KernelStack::new()?;
        let proc = self.procs.insert(|pid| {
            Ok(Process::new(pid, 0, aspace, kstack, entry, esp))
        })?;
        // Unwind the half-built process if the stream setup fails.
        let proc = scopeguard::guard(proc, |proc| self.procs.remove(proc.pid));
        proc.set_name(name);

        {
            let mut files = proc.files.lock();
            let stdin = self.ftable.alloc(FileKind::Console, true, false, false)?;
            let stdout = self.ftable.alloc(FileKind::Console, false, true, false)?;
            let stderr = self.ftable.alloc(FileKind::Console, false, true, false)?;
            assert_eq!(files.alloc(stdin)?, 0);
            assert_eq!(files.alloc(stdout)?, 1);
            assert_eq!(files.alloc(stderr)?, 2);
        }

        let proc = scopeguard::ScopeGuard::into_inner(proc);
        proc.set_state(ProcState::Ready);
        self.sched.add(proc.pid, prio);
        Ok(proc.pid)
    }

    pub fn spawn_init(&self, path: &Path) -> Result<Pid> {
        self.spawn(path, DEFAULT_PRIO)
    }

    /// The periodic tick, called from the timer interrupt after its
    /// EOI. A used-up quantum reschedules.
    pub fn clock_tick(&self) {
        if self.sched.tick() {
            self.switch_away();
        }
    }

    /// Voluntary yield from kernel code.
    pub fn yield_cpu(&self) {
        if self.sched.current().is_none() {
            crate::hal::cpu_relax();
            return;
        }
        self.sched.yield_current();
        self.switch_away();
    }

    /// Blocks the current task on a wait-channel address.
    pub fn sleep_on(&self, chan: usize) {
        let proc = match self.current_proc() {
            Some(p) => p,
            None => {
                crate::hal::cpu_relax();
                return;
            }
        };
        {
            let mut info = proc.info.lock();
            info.state = ProcState::Sleeping;
            info.wait_channel = chan;
        }
        self.sched.sleep_current(None);
        self.switch_away();
    }

    /// Readies every task sleeping on `chan`.
    pub fn wake_addr(&self, chan: usize) {
        for proc in self.procs.snapshot() {
            let mut info = proc.info.lock();
            if info.state == ProcState::Sleeping && info.wait_channel == chan {
                info.state = ProcState::Ready;
                info.wait_channel = 0;
                drop(info);
                self.sched.wake(proc.pid);
            }
        }
    }

    /// Leaves the current task (already moved off the running slot by
    /// the scheduler call that preceded this) and resumes the scheduler
    /// context. On the host this is a no-op so the harness regains
    /// control.
    pub fn deschedule_current(&self) {
        self.switch_away();
    }

    #[cfg(all(target_arch = "x86", not(test)))]
    fn switch_away(&self) {
        swtch::to_scheduler();
    }

    #[cfg(not(all(target_arch = "x86", not(test))))]
    fn switch_away(&self) {}
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        mod swtch {
            use core::ptr;

            use crate::arch::x86::{context_switch, Context};
            use crate::hal;
            use crate::proc::ProcState;

            /// The scheduler's own saved context; tasks switch back
            /// into it when they yield, sleep, or exit.
            static mut SCHED_CTX: *mut Context = ptr::null_mut();

            /// Saves the current task's kernel context and resumes the
            /// scheduler loop. Returns when the scheduler next picks
            /// this task.
            pub fn to_scheduler() {
                let kernel = super::kernel();
                let proc = match kernel.current_proc() {
                    Some(p) => p,
                    // Called before the first task: nothing to save.
                    None => return,
                };
                // SAFETY: we are this task; the saved-esp slot lives in
                // its PCB, and SCHED_CTX was set by scheduler_loop.
                unsafe {
                    let slot =
                        &mut proc.data_mut().kernel_esp as *mut usize as *mut *mut Context;
                    context_switch(slot, SCHED_CTX);
                }
            }

            impl super::Kernel {
                /// The per-CPU scheduling loop: pick, switch, repeat;
                /// idles with interrupts on when nothing is runnable.
                ///
                /// # Safety
                ///
                /// Call once, at the end of boot, on the boot stack.
                pub unsafe fn scheduler_loop(&self) -> ! {
                    loop {
                        hal::intr_on();
                        let pid = match self.sched.pick_next() {
                            Some(pid) => pid,
                            None => {
                                hal::halt();
                                continue;
                            }
                        };
                        let proc = match self.procs.get(pid) {
                            Some(p) => p,
                            None => continue,
                        };
                        proc.set_state(ProcState::Running);
                        // SAFETY: the task is not running anywhere else;
                        // its kernel_esp was seeded or saved by a prior
                        // switch. SCHED_CTX is written by the switch
                        // before the stack changes.
                        unsafe {
                            let new = proc.data().kernel_esp as *const Context;
                            context_switch(
                                core::ptr::addr_of_mut!(SCHED_CTX),
                                new,
                            );
                        }
                        if proc.state() == ProcState::Running {
                            proc.set_state(ProcState::Ready);
                        }
                    }
                }
            }
        }

        /// Boot entry for the kernel image: interrupt plumbing, root
        /// filesystem, first process, then the scheduler forever.
        pub fn kernel_boot(
            root_disk: Arc<dyn crate::device::BlockDevice>,
        ) -> ! {
            // SAFETY: boot path, interrupts still off.
            unsafe { crate::arch::x86::idt::init() };
            crate::arch::x86::pic::remap();

            let kernel = init_kernel();
            let dev = crate::device::register("hda", root_disk);
            kernel.mount_root(dev).expect("mount root filesystem");
            kernel
                .spawn_init(Path::new(b"/bin/init"))
                .expect("spawn init");
            crate::println!("coal kernel booted, root on device {}", dev);
            // SAFETY: end of boot, on the boot stack.
            unsafe { kernel.scheduler_loop() }
        }
    }
}
