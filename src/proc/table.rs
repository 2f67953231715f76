//! The process table: pid allocation, fork, exit, wait, and signals.
//!
//! A fixed pool of slots owns the PCBs through `Arc`; everyone else
//! (scheduler, parent links) refers to processes by pid and looks them
//! up here. Reaping drops the table's reference, and the last drop
//! frees regions, page tables, directory, kernel stack, and PCB in
//! that order.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::lock::SpinLock;
use crate::param::{NPRIO, NPROC, PID_RESERVED};

use super::scheduler::Scheduler;
use super::{Pid, ProcState, Process, RcProc, SIGKILL};

/// Default priority for new tasks, middle of the range.
pub const DEFAULT_PRIO: u8 = (NPRIO / 2) as u8;

/// Pid of the init process; orphans are reparented to it.
pub const INIT_PID: Pid = 1;

struct Slots {
    procs: Vec<Option<RcProc>>,
    next_pid: Pid,
}

pub struct ProcTable {
    inner: SpinLock<Slots>,
}

impl ProcTable {
    pub fn new() -> Self {
        let mut procs = Vec::with_capacity(NPROC);
        procs.resize_with(NPROC, || None);
        Self {
            inner: SpinLock::new(
                "proc table",
                Slots {
                    procs,
                    next_pid: INIT_PID,
                },
            ),
        }
    }

    /// Monotonic pid assignment. The first pass hands out the low ids;
    /// after wraparound they stay reserved.
    fn alloc_pid(slots: &mut Slots) -> Pid {
        loop {
            let pid = slots.next_pid;
            slots.next_pid = slots.next_pid.checked_add(1).unwrap_or(PID_RESERVED);
            let in_use = slots.procs.iter().flatten().any(|p| p.pid == pid);
            if !in_use {
                return pid;
            }
        }
    }

    /// Builds and registers a process. `make` receives the allocated
    /// pid; the new PCB starts INITIALIZING and unscheduled.
    pub fn insert<F>(&self, make: F) -> Result<RcProc>
    where
        F: FnOnce(Pid) -> Result<Process>,
    {
        let mut slots = self.inner.lock();
        let free = slots
            .procs
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::OutOfMemory)?;
        let pid = Self::alloc_pid(&mut slots);
        let proc = Arc::new(make(pid)?);
        slots.procs[free] = Some(proc.clone());
        Ok(proc)
    }

    pub fn get(&self, pid: Pid) -> Option<RcProc> {
        self.inner
            .lock()
            .procs
            .iter()
            .flatten()
            .find(|p| p.pid == pid)
            .cloned()
    }

    pub fn remove(&self, pid: Pid) {
        let mut slots = self.inner.lock();
        for slot in slots.procs.iter_mut() {
            if slot.as_ref().map_or(false, |p| p.pid == pid) {
                let _ = slot.take();
                return;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<RcProc> {
        self.inner.lock().procs.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().procs.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a child copying the parent: address space, open files,
    /// cwd, signal dispositions, group and session. The child's trap
    /// frame is the parent's with a zero return value, so it resumes
    /// in user mode as if its own fork returned.
    ///
    /// # Safety-relevant contract
    ///
    /// Must be called by the task running as `parent`.
    pub fn fork(&self, sched: &Scheduler, parent: &RcProc) -> Result<Pid> {
        // SAFETY: per the contract, we are the parent's task.
        let pdata = unsafe { parent.data() };
        let aspace = pdata.aspace.clone_for_fork()?;
        let kstack = super::KernelStack::new()?;

        let child = self.insert(|pid| {
            Ok(Process::new(
                pid,
                parent.pid,
                aspace,
                kstack,
                pdata.entry,
                pdata.ustack_top,
            ))
        })?;

        // SAFETY: the child is not schedulable yet; we have the only
        // reference that touches its data.
        let cdata = unsafe { child.data_mut() };
        cdata.cwd = pdata.cwd.clone();
        cdata.name = pdata.name;
        // The child resumes from the parent's syscall frame, with
        // fork's return value forced to zero.
        // SAFETY: both stacks are seeded; frames live at their tops.
        unsafe {
            let mut tf = *pdata.kstack.trap_frame_ptr();
            tf.eax = 0;
            *cdata.kstack.trap_frame_ptr() = tf;
        }

        *child.files.lock() = parent.files.lock().clone_for_fork();
        {
            let psig = parent.sig.lock();
            let mut csig = child.sig.lock();
            csig.mask = psig.mask;
            csig.handlers = psig.handlers;
        }
        {
            let pinfo = parent.info.lock();
            let mut cinfo = child.info.lock();
            cinfo.pgid = pinfo.pgid;
            cinfo.sid = pinfo.sid;
        }

        let prio = sched
            .tcb(parent.pid)
            .map(|t| t.base_prio)
            .unwrap_or(DEFAULT_PRIO);
        child.set_state(ProcState::Ready);
        sched.add(child.pid, prio);
        Ok(child.pid)
    }

    /// Exits the calling process: closes files, records the status,
    /// reparents its children to init, wakes the parent, and leaves the
    /// PCB addressable as a zombie until the parent reaps it.
    pub fn exit(&self, sched: &Scheduler, proc: &RcProc, status: i32) {
        proc.files.lock().close_all();

        for other in self.snapshot() {
            let mut info = other.info.lock();
            if info.ppid == proc.pid {
                info.ppid = INIT_PID;
            }
        }
        if let Some(init) = self.get(INIT_PID) {
            init.child_wait.wakeup();
        }

        {
            let mut info = proc.info.lock();
            info.exit_status = status;
            info.has_exited = true;
            info.state = ProcState::Zombie;
        }
        sched.exit_current();

        if let Some(parent) = self.get(proc.ppid()) {
            parent.child_wait.wakeup();
        }
    }

    /// Waits for a child (`pid` = -1 for any) to exit and reaps it,
    /// returning its pid and exit status. `WNOHANG` (options bit 0)
    /// returns `(0, 0)` instead of blocking.
    pub fn waitpid(
        &self,
        sched: &Scheduler,
        parent: &RcProc,
        pid: Pid,
        options: u32,
    ) -> Result<(Pid, i32)> {
        loop {
            let mut have_kids = false;
            for child in self.snapshot() {
                let (is_child, zombie, status) = {
                    let info = child.info.lock();
                    (
                        info.ppid == parent.pid && (pid == -1 || child.pid == pid),
                        info.state == ProcState::Zombie,
                        info.exit_status,
                    )
                };
                if !is_child {
                    continue;
                }
                have_kids = true;
                if zombie {
                    // Reap: drop the table's reference and the
                    // scheduler's bookkeeping. The last Arc drop frees
                    // the address space, kernel stack, and PCB.
                    let cpid = child.pid;
                    sched.remove(cpid);
                    self.remove(cpid);
                    return Ok((cpid, status));
                }
            }
            if !have_kids {
                return Err(KernelError::NotFound);
            }
            if options & 1 != 0 {
                return Ok((0, 0));
            }
            let mut info = parent.info.lock();
            parent.child_wait.sleep(&mut info);
        }
    }

    /// Posts `sig` to one process, waking it if it sleeps. SIGKILL also
    /// flags the task so it exits at the next user-mode return.
    pub fn kill(&self, sched: &Scheduler, pid: Pid, sig: u32) -> Result<()> {
        let proc = self.get(pid).ok_or(KernelError::NotFound)?;
        proc.sig.lock().post(sig)?;
        if sig == SIGKILL {
            proc.kill();
        }
        if proc.state() == ProcState::Sleeping {
            proc.set_state(ProcState::Ready);
            sched.wake(pid);
        }
        Ok(())
    }

    /// Posts `sig` to every member of a process group.
    pub fn signal_group(&self, sched: &Scheduler, pgid: Pid, sig: u32) -> Result<usize> {
        let mut hit = 0;
        for proc in self.snapshot() {
            if proc.info.lock().pgid == pgid {
                self.kill(sched, proc.pid, sig)?;
                hit += 1;
            }
        }
        if hit == 0 {
            return Err(KernelError::NotFound);
        }
        Ok(hit)
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::KernelStack;
    use crate::vm::AddressSpace;

    fn add_proc(table: &ProcTable, ppid: Pid) -> RcProc {
        table
            .insert(|pid| {
                Ok(Process::new(
                    pid,
                    ppid,
                    AddressSpace::new()?,
                    KernelStack::new()?,
                    0x40_0000,
                    0xC000_0000,
                ))
            })
            .unwrap()
    }

    #[test]
    fn pids_are_monotonic() {
        let table = ProcTable::new();
        let a = add_proc(&table, 0);
        let b = add_proc(&table, 0);
        let c = add_proc(&table, 0);
        assert!(a.pid < b.pid && b.pid < c.pid);
    }

    #[test]
    fn zombie_stays_addressable_until_reaped_then_frees_once() {
        let table = ProcTable::new();
        let sched = Scheduler::new();
        let parent = add_proc(&table, 0);
        sched.add(parent.pid, DEFAULT_PRIO);

        let child = add_proc(&table, parent.pid);
        sched.add(child.pid, DEFAULT_PRIO);
        assert_eq!(sched.pick_next(), Some(parent.pid));

        // Child exits (scheduler-wise it was READY, not current; emulate
        // by making it current first).
        sched.yield_current();
        while sched.pick_next() != Some(child.pid) {
            sched.yield_current();
        }
        table.exit(&sched, &child, 42);

        // Still addressable as a zombie.
        let again = table.get(child.pid).expect("zombie still in table");
        assert_eq!(again.state(), ProcState::Zombie);
        assert!(again.info.lock().has_exited);
        drop(again);

        let weak = Arc::downgrade(&child);
        drop(child);
        let (pid, status) = table.waitpid(&sched, &parent, -1, 0).unwrap();
        assert_eq!(status, 42);
        assert!(table.get(pid).is_none());
        // The PCB and its resources are gone exactly once: no owner
        // remains.
        assert_eq!(weak.strong_count(), 0);
    }

    #[test]
    fn orphans_are_reparented_to_init() {
        let table = ProcTable::new();
        let sched = Scheduler::new();
        let init = add_proc(&table, 0);
        assert_eq!(init.pid, INIT_PID);
        let parent = add_proc(&table, INIT_PID);
        let orphan = add_proc(&table, parent.pid);
        sched.add(parent.pid, DEFAULT_PRIO);
        sched.add(orphan.pid, DEFAULT_PRIO);

        let _ = sched.pick_next();
        table.exit(&sched, &parent, 0);
        assert_eq!(orphan.ppid(), INIT_PID);
    }

    #[test]
    fn waitpid_with_no_children_fails() {
        let table = ProcTable::new();
        let sched = Scheduler::new();
        let lonely = add_proc(&table, 0);
        assert_eq!(
            table.waitpid(&sched, &lonely, -1, 0).err(),
            Some(KernelError::NotFound)
        );
    }

    #[test]
    fn wnohang_returns_zero_for_live_children() {
        let table = ProcTable::new();
        let sched = Scheduler::new();
        let parent = add_proc(&table, 0);
        let _child = add_proc(&table, parent.pid);
        assert_eq!(table.waitpid(&sched, &parent, -1, 1).unwrap(), (0, 0));
    }
}
