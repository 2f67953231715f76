//! Priority scheduler.
//!
//! Single CPU, preemptive. One FIFO per priority level; a 32-bit bitmap
//! records which levels are non-empty, so picking the next task is a
//! find-first-set and a pop. The periodic tick burns the running task's
//! quantum, drains expired sleepers, and boosts tasks that have waited
//! too long by one level until they next run.
//!
//! The scheduler tracks pids only; process state words live in the PCB
//! and are updated by the process table around these calls. A task is
//! always in exactly one of: a run-queue level, the sleep list, the
//! running slot, or the zombie list.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::lock::SpinLock;
use crate::param::{NPRIO, STARVATION_TICKS, TIME_SLICE};

use super::Pid;

/// Run-queue bookkeeping for one task.
#[derive(Clone, Copy, Debug)]
pub struct Tcb {
    /// Current level; 0 is most urgent.
    pub prio: u8,
    /// Level the task returns to after a boost.
    pub base_prio: u8,
    pub boosted: bool,
    /// Ticks spent READY since last run.
    pub wait_ticks: u32,
    /// Quantum remaining, in ticks.
    pub slice: u32,
    /// Absolute tick to wake at while sleeping.
    pub wakeup: u64,
}

/// Where a task currently lives; each task is in exactly one place.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskPlace {
    Queue(u8),
    Sleeping,
    Running,
    Zombie,
}

struct SchedInner {
    queues: [VecDeque<Pid>; NPRIO],
    /// Bit L set iff queue L is non-empty.
    bitmap: u32,
    tcbs: BTreeMap<Pid, Tcb>,
    /// (deadline, pid), ascending by deadline.
    sleepers: Vec<(u64, Pid)>,
    current: Option<Pid>,
    zombies: Vec<Pid>,
    ticks: u64,
}

impl SchedInner {
    fn enqueue(&mut self, pid: Pid, level: u8) {
        self.queues[level as usize].push_back(pid);
        self.bitmap |= 1 << level;
    }

    fn pop_level(&mut self, level: u8) -> Option<Pid> {
        let pid = self.queues[level as usize].pop_front();
        if self.queues[level as usize].is_empty() {
            self.bitmap &= !(1 << level);
        }
        pid
    }

    fn unqueue(&mut self, pid: Pid) {
        for level in 0..NPRIO {
            if let Some(pos) = self.queues[level].iter().position(|&p| p == pid) {
                let _ = self.queues[level].remove(pos);
                if self.queues[level].is_empty() {
                    self.bitmap &= !(1 << level as u32);
                }
                return;
            }
        }
    }

    fn unsleep(&mut self, pid: Pid) -> bool {
        if let Some(pos) = self.sleepers.iter().position(|&(_, p)| p == pid) {
            let _ = self.sleepers.remove(pos);
            return true;
        }
        false
    }
}

pub struct Scheduler {
    inner: SpinLock<SchedInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "scheduler",
                SchedInner {
                    queues: array_macro::array![_ => VecDeque::new(); NPRIO],
                    bitmap: 0,
                    tcbs: BTreeMap::new(),
                    sleepers: Vec::new(),
                    current: None,
                    zombies: Vec::new(),
                    ticks: 0,
                },
            ),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.inner.lock().ticks
    }

    pub fn current(&self) -> Option<Pid> {
        self.inner.lock().current
    }

    pub fn bitmap(&self) -> u32 {
        self.inner.lock().bitmap
    }

    pub fn queue_len(&self, level: u8) -> usize {
        self.inner.lock().queues[level as usize].len()
    }

    /// Admits a task at `prio`, READY at the tail of its level.
    pub fn add(&self, pid: Pid, prio: u8) {
        assert!((prio as usize) < NPRIO);
        let mut inner = self.inner.lock();
        let old = inner.tcbs.insert(
            pid,
            Tcb {
                prio,
                base_prio: prio,
                boosted: false,
                wait_ticks: 0,
                slice: TIME_SLICE[prio as usize],
                wakeup: 0,
            },
        );
        assert!(old.is_none(), "task already scheduled");
        inner.enqueue(pid, prio);
    }

    /// Removes a reaped task entirely.
    pub fn remove(&self, pid: Pid) {
        let mut inner = self.inner.lock();
        if inner.current == Some(pid) {
            inner.current = None;
        }
        inner.unqueue(pid);
        let _ = inner.unsleep(pid);
        inner.zombies.retain(|&p| p != pid);
        let _ = inner.tcbs.remove(&pid);
    }

    /// Picks the READY task from the highest non-empty level, FIFO
    /// within the level, and makes it current. O(1): find-first-set on
    /// the bitmap, pop the head. A boost ends here: the task runs, then
    /// continues from its base level.
    pub fn pick_next(&self) -> Option<Pid> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.current.is_none(), "pick with a task still current");
        if inner.bitmap == 0 {
            return None;
        }
        let level = inner.bitmap.trailing_zeros() as u8;
        let pid = inner.pop_level(level).expect("bitmap said non-empty");
        let tcb = inner.tcbs.get_mut(&pid).expect("queued task has a tcb");
        if tcb.boosted {
            tcb.boosted = false;
            tcb.prio = tcb.base_prio;
        }
        tcb.wait_ticks = 0;
        tcb.slice = TIME_SLICE[tcb.prio as usize];
        inner.current = Some(pid);
        Some(pid)
    }

    /// Voluntary yield: the current task goes to the tail of its level.
    pub fn yield_current(&self) {
        let mut inner = self.inner.lock();
        if let Some(pid) = inner.current.take() {
            let level = inner.tcbs[&pid].prio;
            inner.enqueue(pid, level);
        }
    }

    /// Parks the current task on the sleep list until `deadline` ticks
    /// (or indefinitely for pure blocking).
    pub fn sleep_current(&self, deadline: Option<u64>) {
        let mut inner = self.inner.lock();
        if let Some(pid) = inner.current.take() {
            let deadline = deadline.unwrap_or(u64::MAX);
            inner.tcbs.get_mut(&pid).expect("current has a tcb").wakeup = deadline;
            let pos = inner
                .sleepers
                .partition_point(|&(d, _)| d <= deadline);
            inner.sleepers.insert(pos, (deadline, pid));
        }
    }

    /// Readies a sleeping task before its deadline (event wakeup).
    pub fn wake(&self, pid: Pid) {
        let mut inner = self.inner.lock();
        if inner.unsleep(pid) {
            let level = inner.tcbs[&pid].prio;
            inner.tcbs.get_mut(&pid).expect("tcb").wait_ticks = 0;
            inner.enqueue(pid, level);
        }
    }

    /// Moves the current task to the zombie list (exit path).
    pub fn exit_current(&self) {
        let mut inner = self.inner.lock();
        if let Some(pid) = inner.current.take() {
            inner.zombies.push(pid);
        }
    }

    /// The periodic tick: drains due sleepers, ages waiting tasks
    /// (boosting the starved by one level), and burns the current
    /// task's quantum. Returns true when the caller should reschedule.
    pub fn tick(&self) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.ticks += 1;
        let now = inner.ticks;

        while let Some(&(deadline, pid)) = inner.sleepers.first() {
            if deadline > now {
                break;
            }
            let _ = inner.sleepers.remove(0);
            let level = inner.tcbs[&pid].prio;
            inner.tcbs.get_mut(&pid).expect("tcb").wait_ticks = 0;
            inner.enqueue(pid, level);
        }

        let mut boosts: Vec<Pid> = Vec::new();
        for level in 0..NPRIO {
            for &pid in &inner.queues[level] {
                let tcb = inner.tcbs.get_mut(&pid).expect("queued task has a tcb");
                tcb.wait_ticks += 1;
                if tcb.wait_ticks >= STARVATION_TICKS && tcb.prio > 0 {
                    boosts.push(pid);
                }
            }
        }
        for pid in boosts {
            inner.unqueue(pid);
            let tcb = inner.tcbs.get_mut(&pid).expect("tcb");
            tcb.prio -= 1;
            tcb.boosted = true;
            tcb.wait_ticks = 0;
            let level = tcb.prio;
            inner.enqueue(pid, level);
        }

        if let Some(pid) = inner.current {
            let tcb = inner.tcbs.get_mut(&pid).expect("current has a tcb");
            tcb.slice = tcb.slice.saturating_sub(1);
            if tcb.slice == 0 {
                let level = tcb.prio;
                inner.current = None;
                inner.enqueue(pid, level);
                return true;
            }
        }
        false
    }

    /// Where `pid` lives right now; None if unknown.
    pub fn place_of(&self, pid: Pid) -> Option<TaskPlace> {
        let inner = self.inner.lock();
        if inner.current == Some(pid) {
            return Some(TaskPlace::Running);
        }
        for level in 0..NPRIO {
            if inner.queues[level].contains(&pid) {
                return Some(TaskPlace::Queue(level as u8));
            }
        }
        if inner.sleepers.iter().any(|&(_, p)| p == pid) {
            return Some(TaskPlace::Sleeping);
        }
        if inner.zombies.contains(&pid) {
            return Some(TaskPlace::Zombie);
        }
        None
    }

    pub fn tcb(&self, pid: Pid) -> Option<Tcb> {
        self.inner.lock().tcbs.get(&pid).copied()
    }

    /// Checks the bitmap against queue occupancy; test support.
    pub fn bitmap_consistent(&self) -> bool {
        let inner = self.inner.lock();
        (0..NPRIO).all(|level| {
            let bit = inner.bitmap & (1 << level) != 0;
            bit == !inner.queues[level].is_empty()
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Gives up the CPU from an arbitrary kernel path. Outside a running
/// scheduler (boot, host tests) it degrades to a CPU relax.
pub fn yield_now() {
    #[cfg(test)]
    {
        std::thread::yield_now();
    }
    #[cfg(not(test))]
    {
        match crate::kernel::try_kernel() {
            Some(kernel) => kernel.yield_cpu(),
            None => crate::hal::cpu_relax(),
        }
    }
}

/// Blocks the current task on a channel address.
pub fn sleep_on(chan: usize) {
    #[cfg(test)]
    {
        let _ = chan;
        std::thread::yield_now();
    }
    #[cfg(not(test))]
    {
        match crate::kernel::try_kernel() {
            Some(kernel) => kernel.sleep_on(chan),
            None => crate::hal::cpu_relax(),
        }
    }
}

/// Readies every task sleeping on a channel address.
pub fn wake_addr(chan: usize) {
    #[cfg(test)]
    {
        let _ = chan;
    }
    #[cfg(not(test))]
    {
        if let Some(kernel) = crate::kernel::try_kernel() {
            kernel.wake_addr(chan);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_queue_occupancy() {
        let s = Scheduler::new();
        assert_eq!(s.bitmap(), 0);
        s.add(10, 3);
        s.add(11, 5);
        assert_eq!(s.bitmap(), (1 << 3) | (1 << 5));
        assert!(s.bitmap_consistent());

        assert_eq!(s.pick_next(), Some(10));
        assert_eq!(s.bitmap(), 1 << 5);
        assert!(s.bitmap_consistent());
        s.yield_current();
        assert!(s.bitmap_consistent());
    }

    #[test]
    fn pick_prefers_the_most_urgent_level_fifo_within_it() {
        let s = Scheduler::new();
        s.add(1, 5);
        s.add(2, 3);
        s.add(3, 3);
        // Scenario S3 shape: priority 3 beats priority 5; FIFO ties.
        assert_eq!(s.pick_next(), Some(2));
        s.yield_current();
        assert_eq!(s.pick_next(), Some(3));
        s.yield_current();
        assert_eq!(s.pick_next(), Some(2));
        s.exit_current();
        assert_eq!(s.pick_next(), Some(3));
        s.exit_current();
        assert_eq!(s.pick_next(), Some(1));
    }

    #[test]
    fn quantum_expiry_requeues_at_the_tail() {
        let s = Scheduler::new();
        s.add(1, 0);
        s.add(2, 0);
        assert_eq!(s.pick_next(), Some(1));
        // Level-0 quantum is TIME_SLICE[0] ticks.
        for _ in 0..TIME_SLICE[0] - 1 {
            assert!(!s.tick());
        }
        assert!(s.tick());
        assert_eq!(s.current(), None);
        // FIFO: 2 was waiting, 1 went to the tail.
        assert_eq!(s.pick_next(), Some(2));
    }

    #[test]
    fn sleepers_wake_at_their_deadline_in_order() {
        let s = Scheduler::new();
        s.add(1, 2);
        s.add(2, 2);
        assert_eq!(s.pick_next(), Some(1));
        s.sleep_current(Some(3));
        assert_eq!(s.place_of(1), Some(TaskPlace::Sleeping));

        assert_eq!(s.pick_next(), Some(2));
        s.sleep_current(Some(5));

        for _ in 0..3 {
            let _ = s.tick();
        }
        assert_eq!(s.place_of(1), Some(TaskPlace::Queue(2)));
        assert_eq!(s.place_of(2), Some(TaskPlace::Sleeping));
        for _ in 0..2 {
            let _ = s.tick();
        }
        assert_eq!(s.place_of(2), Some(TaskPlace::Queue(2)));
        assert_eq!(s.pick_next(), Some(1));
    }

    #[test]
    fn starved_tasks_get_a_one_level_boost_reset_on_run() {
        let s = Scheduler::new();
        // 1 at level 3 monopolizes the CPU; 2 at level 4 starves.
        s.add(1, 3);
        s.add(2, 4);
        assert_eq!(s.pick_next(), Some(1));

        let mut observed_boost = false;
        for _ in 0..(STARVATION_TICKS + 2 * TIME_SLICE[3] + 2) {
            if s.tick() {
                let next = s.pick_next().unwrap();
                if next == 2 {
                    // 2 could only win from level 3, and running resets
                    // the boost back to its base level.
                    let tcb = s.tcb(2).unwrap();
                    assert!(!tcb.boosted);
                    assert_eq!(tcb.prio, 4);
                    assert!(observed_boost);
                    return;
                }
            } else if s.place_of(2) == Some(TaskPlace::Queue(3)) && !observed_boost {
                assert!(s.tcb(2).unwrap().boosted);
                observed_boost = true;
            }
        }
        panic!("starved task never ran");
    }

    #[test]
    fn task_is_in_exactly_one_place() {
        let s = Scheduler::new();
        s.add(7, 1);
        assert_eq!(s.place_of(7), Some(TaskPlace::Queue(1)));
        assert_eq!(s.pick_next(), Some(7));
        assert_eq!(s.place_of(7), Some(TaskPlace::Running));
        s.sleep_current(Some(100));
        assert_eq!(s.place_of(7), Some(TaskPlace::Sleeping));
        s.wake(7);
        assert_eq!(s.place_of(7), Some(TaskPlace::Queue(1)));
        assert_eq!(s.pick_next(), Some(7));
        s.exit_current();
        assert_eq!(s.place_of(7), Some(TaskPlace::Zombie));
        s.remove(7);
        assert_eq!(s.place_of(7), None);
    }
}
