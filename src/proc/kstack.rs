//! Per-process kernel stacks.
//!
//! Four physically contiguous frames per process. A fresh stack is
//! seeded for its first resume: a trap frame describing the initial
//! user context sits at the top, and below it a switch context whose
//! return address is the first-return trampoline. The saved kernel ESP
//! stored in the PCB points at that context, so the very first
//! `context_switch` onto this stack "returns" into user mode.

use core::mem;

use crate::arch::{Context, TrapFrame};
use crate::error::Result;
use crate::kalloc::PhysPages;
use crate::param::KSTACKPAGES;

pub struct KernelStack {
    frames: PhysPages,
}

impl KernelStack {
    pub fn new() -> Result<Self> {
        Ok(Self {
            frames: PhysPages::alloc_zeroed(KSTACKPAGES)?,
        })
    }

    /// Physical base of the stack frames.
    pub fn base_pa(&self) -> usize {
        self.frames.pa()
    }

    /// Kernel-virtual top (one past the highest byte).
    pub fn top(&self) -> usize {
        self.frames.as_ptr() as usize + self.frames.len_bytes()
    }

    /// Seeds the stack with an initial trap frame for `entry` running on
    /// `ustack_top`, returning the kernel ESP to save in the PCB.
    pub fn prepare(&mut self, entry: usize, ustack_top: usize) -> usize {
        let top = self.top();
        let tf_addr = top - mem::size_of::<TrapFrame>();
        let ctx_addr = tf_addr - mem::size_of::<Context>();

        let tf = TrapFrame::new_user(entry, ustack_top);
        let ctx = Context {
            eip: first_return_entry() as u32,
            ..Context::default()
        };
        // SAFETY: both records lie inside the freshly allocated stack.
        unsafe {
            (tf_addr as *mut TrapFrame).write(tf);
            (ctx_addr as *mut Context).write(ctx);
        }
        ctx_addr
    }

    /// The seeded trap frame, for tweaking registers before first run
    /// (fork return value, exec arguments).
    pub fn trap_frame_ptr(&self) -> *mut TrapFrame {
        (self.top() - mem::size_of::<TrapFrame>()) as *mut TrapFrame
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        /// A first scheduling of a new task "returns" here; the stack
        /// pointer sits just below the seeded trap frame.
        #[no_mangle]
        extern "C" fn first_user_return() -> ! {
            // SAFETY: entered only via the context seeded in `prepare`,
            // so esp points at a complete trap frame.
            unsafe {
                core::arch::asm!(
                    "jmp trapret",
                    options(noreturn),
                )
            }
        }

        fn first_return_entry() -> usize {
            first_user_return as usize
        }
    } else {
        fn first_return_entry() -> usize {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::FL_IF;

    #[test]
    fn prepared_stack_frames_the_user_context() {
        let mut ks = KernelStack::new().unwrap();
        let esp = ks.prepare(0x40_0000, 0xBFFF_FFF0);
        assert_eq!(
            esp,
            ks.top() - mem::size_of::<TrapFrame>() - mem::size_of::<Context>()
        );
        // SAFETY: prepare seeded the frame.
        let tf = unsafe { &*ks.trap_frame_ptr() };
        assert_eq!(tf.eip, 0x40_0000);
        assert_eq!(tf.useresp, 0xBFFF_FFF0);
        assert!(tf.from_user());
        assert_eq!(tf.eflags & FL_IF, FL_IF);
    }
}
