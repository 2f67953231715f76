//! Processes.
//!
//! The PCB (`Process`) splits its state by who may touch it: `info`
//! behind its spinlock for fields other tasks read, `sig` behind the
//! signal lock, the fd table behind its own lock, and `data` private to
//! the process itself (only the task running as this process touches
//! it, so it needs no lock). The process table, fork/exit/wait, and the
//! scheduler live in the sibling modules.

pub mod exec;
pub mod kstack;
pub mod scheduler;
pub mod table;
pub mod wait_channel;

pub use kstack::KernelStack;
pub use scheduler::Scheduler;
pub use table::ProcTable;
pub use wait_channel::WaitChannel;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::error::{KernelError, Result};
use crate::file::RcFile;
use crate::lock::SpinLock;
use crate::param::{MAXPATH, NOFILE, NSIG};
use crate::vm::AddressSpace;

pub type Pid = i32;

pub const SIGKILL: u32 = 9;
pub const SIGSTOP: u32 = 19;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    /// Being built; not yet schedulable.
    Initializing,
    Ready,
    Running,
    Sleeping,
    /// Exited, awaiting reap by the parent.
    Zombie,
}

/// Fields other tasks read; hold `Process::info` to touch them.
pub struct ProcInfo {
    pub state: ProcState,
    pub ppid: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub exit_status: i32,
    pub has_exited: bool,
    /// Channel address while sleeping; 0 otherwise.
    pub wait_channel: usize,
}

bitflags! {
    /// Signal bit positions 1..32 as a mask word.
    pub struct SigSet: u32 {
        const KILL = 1 << (SIGKILL - 1);
        const STOP = 1 << (SIGSTOP - 1);
        const ALL = 0xFFFF_FFFF;
    }
}

impl SigSet {
    pub fn of(sig: u32) -> Option<Self> {
        if sig >= 1 && sig <= NSIG as u32 {
            SigSet::from_bits(1 << (sig - 1))
        } else {
            None
        }
    }

    /// SIGKILL and SIGSTOP can be neither masked nor handled.
    pub fn unblockable() -> Self {
        SigSet::KILL | SigSet::STOP
    }
}

/// Disposition slots; 0 = default, 1 = ignore, else user handler va.
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

pub struct SignalState {
    pub mask: SigSet,
    pub pending: SigSet,
    pub handlers: [usize; NSIG],
}

impl SignalState {
    fn new() -> Self {
        Self {
            mask: SigSet::empty(),
            pending: SigSet::empty(),
            handlers: [SIG_DFL; NSIG],
        }
    }

    /// Posts `sig`; unmaskable signals always land.
    pub fn post(&mut self, sig: u32) -> Result<()> {
        let bit = SigSet::of(sig).ok_or(KernelError::InvalidArgument)?;
        self.pending |= bit;
        Ok(())
    }

    /// The next deliverable signal number, if any.
    pub fn take_deliverable(&mut self) -> Option<u32> {
        let deliverable = self.pending & (!self.mask | SigSet::unblockable());
        if deliverable.is_empty() {
            return None;
        }
        let sig = deliverable.bits().trailing_zeros() + 1;
        self.pending &= !SigSet::of(sig).expect("valid signal");
        Some(sig)
    }

    pub fn set_handler(&mut self, sig: u32, handler: usize) -> Result<usize> {
        let bit = SigSet::of(sig).ok_or(KernelError::InvalidArgument)?;
        if bit.intersects(SigSet::unblockable()) {
            return Err(KernelError::InvalidArgument);
        }
        let slot = &mut self.handlers[(sig - 1) as usize];
        Ok(core::mem::replace(slot, handler))
    }

    pub fn handler(&self, sig: u32) -> usize {
        self.handlers[(sig - 1) as usize]
    }

    pub fn set_mask(&mut self, mask: SigSet) {
        self.mask = mask - SigSet::unblockable();
    }
}

/// Per-process descriptor table; indices 0-2 carry the standard
/// streams.
pub struct FdTable {
    slots: [Option<RcFile>; NOFILE],
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: array_macro::array![_ => None; NOFILE],
        }
    }

    /// Installs `file` at the lowest free descriptor.
    pub fn alloc(&mut self, file: RcFile) -> Result<i32> {
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd as i32);
            }
        }
        Err(KernelError::TooManyFiles)
    }

    pub fn get(&self, fd: i32) -> Result<RcFile> {
        self.slots
            .get(usize::try_from(fd).map_err(|_| KernelError::BadFd)?)
            .and_then(|s| s.clone())
            .ok_or(KernelError::BadFd)
    }

    /// dup2 semantics: close whatever held `fd`, install `file`.
    pub fn install(&mut self, fd: i32, file: RcFile) -> Result<()> {
        let slot = self
            .slots
            .get_mut(usize::try_from(fd).map_err(|_| KernelError::BadFd)?)
            .ok_or(KernelError::BadFd)?;
        *slot = Some(file);
        Ok(())
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let slot = self
            .slots
            .get_mut(usize::try_from(fd).map_err(|_| KernelError::BadFd)?)
            .ok_or(KernelError::BadFd)?;
        slot.take().map(|_| ()).ok_or(KernelError::BadFd)
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            let _ = slot.take();
        }
    }

    /// Clone for fork: the child shares every open file object.
    pub fn clone_for_fork(&self) -> Self {
        let mut new = Self::new();
        for (i, slot) in self.slots.iter().enumerate() {
            new.slots[i] = slot.clone();
        }
        new
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields private to the process; only the task running as this process
/// touches them, so no lock is needed.
pub struct ProcData {
    pub aspace: AddressSpace,
    pub kstack: KernelStack,
    pub entry: usize,
    pub ustack_top: usize,
    /// Saved kernel ESP for the next context switch onto this task.
    pub kernel_esp: usize,
    pub cwd: ArrayVec<u8, MAXPATH>,
    pub name: [u8; 16],
}

/// Per-process state.
pub struct Process {
    pub pid: Pid,
    pub info: SpinLock<ProcInfo>,
    pub sig: SpinLock<SignalState>,
    pub files: SpinLock<FdTable>,
    data: UnsafeCell<ProcData>,
    killed: AtomicBool,
    /// Parents sleep here for exiting children.
    pub child_wait: WaitChannel,
}

// SAFETY: `data` is only accessed by the task running as this process
// (or by setup code before the process is schedulable); everything else
// is behind locks.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    pub fn new(
        pid: Pid,
        ppid: Pid,
        aspace: AddressSpace,
        mut kstack: KernelStack,
        entry: usize,
        ustack_top: usize,
    ) -> Self {
        let kernel_esp = kstack.prepare(entry, ustack_top);
        let mut cwd = ArrayVec::new();
        let _ = cwd.try_push(b'/');
        Self {
            pid,
            info: SpinLock::new(
                "proc info",
                ProcInfo {
                    state: ProcState::Initializing,
                    ppid,
                    pgid: pid,
                    sid: pid,
                    exit_status: 0,
                    has_exited: false,
                    wait_channel: 0,
                },
            ),
            sig: SpinLock::new("proc signals", SignalState::new()),
            files: SpinLock::new("proc files", FdTable::new()),
            data: UnsafeCell::new(ProcData {
                aspace,
                kstack,
                entry,
                ustack_top,
                kernel_esp,
                cwd,
                name: [0; 16],
            }),
            killed: AtomicBool::new(false),
            child_wait: WaitChannel::new(),
        }
    }

    /// Accesses the process-private data.
    ///
    /// # Safety
    ///
    /// The caller must be the task running as this process, or hold the
    /// process un-runnable (setup, reaping).
    pub unsafe fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    ///
    /// Same as `data`, plus exclusivity.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ProcState {
        self.info.lock().state
    }

    pub fn set_state(&self, state: ProcState) {
        self.info.lock().state = state;
    }

    pub fn ppid(&self) -> Pid {
        self.info.lock().ppid
    }

    pub fn set_name(&self, name: &[u8]) {
        // SAFETY: called during setup or by the process itself.
        let data = unsafe { self.data_mut() };
        data.name = [0; 16];
        let n = name.len().min(15);
        data.name[..n].copy_from_slice(&name[..n]);
    }
}

pub type RcProc = Arc<Process>;
