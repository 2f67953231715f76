//! Trap dispatch.
//!
//! Every vector funnels through `trap_dispatch`: the syscall gate, the
//! 16 remapped hardware IRQs, and the CPU exceptions. The end-of-
//! interrupt discipline lives here: the timer acknowledges *before*
//! running the scheduler tick, because the tick may context-switch and
//! never return through this stack; every other IRQ acknowledges after
//! its handler returns.

use crate::arch::x86::idt::{irq_vector, vector_to_irq, IRQ_TIMER, T_PGFLT, T_SYSCALL};
use crate::arch::x86::pic;
use crate::arch::TrapFrame;
use crate::console;
use crate::kernel;
use crate::lock::SpinLock;
use crate::proc::{ProcState, SIG_DFL, SIG_IGN, SIGKILL};
use crate::syscall;
use crate::uaccess;

pub type IrqHandler = fn();

static IRQ_HANDLERS: SpinLock<[Option<IrqHandler>; 16]> =
    SpinLock::new("irq handlers", [None; 16]);

/// Registers a device IRQ handler (disk, keyboard drivers call this
/// from their collaborator init).
pub fn register_irq(irq: u8, handler: IrqHandler) {
    IRQ_HANDLERS.lock()[irq as usize] = Some(handler);
}

/// The faulting address of the last page fault.
fn fault_address() -> usize {
    #[cfg(all(target_arch = "x86", not(test)))]
    {
        let cr2: u32;
        // SAFETY: reading CR2 has no side effects.
        unsafe { core::arch::asm!("mov {}, cr2", out(reg) cr2) };
        cr2 as usize
    }
    #[cfg(not(all(target_arch = "x86", not(test))))]
    {
        0
    }
}

/// C-level dispatcher, entered from `alltraps` with the saved frame.
#[no_mangle]
pub extern "C" fn trap_dispatch(tf: &mut TrapFrame) {
    let vector = tf.vector as u8;

    if vector == T_SYSCALL {
        if let Some(kernel) = kernel::try_kernel() {
            if let Some(proc) = kernel.current_proc() {
                syscall::dispatch(&proc, tf);
                before_user_return(&proc, tf);
                return;
            }
        }
        tf.set_ret(crate::error::KernelError::NotSupported.to_ret());
        return;
    }

    if vector == irq_vector(IRQ_TIMER) {
        // EOI first: the tick below may switch away and return to user
        // mode through another task's stack.
        pic::end_of_interrupt(IRQ_TIMER);
        if let Some(kernel) = kernel::try_kernel() {
            kernel.clock_tick();
        }
        return;
    }

    if let Some(irq) = vector_to_irq(vector) {
        let handler = IRQ_HANDLERS.lock()[irq as usize];
        if let Some(handler) = handler {
            handler();
        }
        pic::end_of_interrupt(irq);
        return;
    }

    if vector == T_PGFLT {
        page_fault(tf, fault_address());
        return;
    }

    // Remaining CPU exceptions.
    if tf.from_user() {
        if let Some(kernel) = kernel::try_kernel() {
            if let Some(proc) = kernel.current_proc() {
                let _ = proc.sig.lock().post(11); // SIGSEGV-class fault
                proc.kill();
                before_user_return(&proc, tf);
                return;
            }
        }
        return;
    }
    kernel_panic(tf, "unexpected trap");
}

/// Page-fault policy: user faults inside the stack reservation grow the
/// stack; any other user fault is a fatal signal to the process; kernel
/// faults panic unless a user-access primitive registered its landing
/// pad.
fn page_fault(tf: &mut TrapFrame, addr: usize) {
    if tf.from_user() {
        if let Some(kernel) = kernel::try_kernel() {
            if let Some(proc) = kernel.current_proc() {
                // SAFETY: we are the faulting process's task.
                let data = unsafe { proc.data_mut() };
                if data.aspace.grow_stack(addr).is_ok() {
                    return;
                }
                let _ = proc.sig.lock().post(11);
                proc.kill();
                before_user_return(&proc, tf);
                return;
            }
        }
        return;
    }
    if uaccess::in_user_access() {
        // The copy primitives validate before touching memory, so this
        // is the landing pad for the unexpected: fail the copy path by
        // returning; the primitive reports bytes-not-copied.
        return;
    }
    kernel_panic(tf, "kernel page fault");
}

/// Runs on the way back to user mode: a killed task exits here, and
/// pending unblocked signals are delivered best-effort.
pub fn before_user_return(proc: &crate::proc::RcProc, tf: &mut TrapFrame) {
    if proc.killed() {
        exit_process(proc, -1);
        return;
    }
    let next = proc.sig.lock().take_deliverable();
    let sig = match next {
        Some(sig) => sig,
        None => return,
    };
    if sig == SIGKILL {
        exit_process(proc, -1);
        return;
    }
    let handler = proc.sig.lock().handler(sig);
    match handler {
        SIG_IGN => {}
        SIG_DFL => {
            // Default disposition: terminate, except for the
            // child-status and continue signals which are ignored.
            if !matches!(sig, 17 | 18 | 23) {
                exit_process(proc, -(sig as i32));
            }
        }
        handler_va => {
            // Redirect to the handler: push the interrupted eip and the
            // signal number, best-effort. No sigreturn trampoline; the
            // handler returns straight to the interrupted code.
            // SAFETY: we are this process's task.
            let data = unsafe { proc.data_mut() };
            let mut esp = tf.useresp as usize;
            esp -= 4;
            let _ = data.aspace.write_bytes(esp, &tf.eip.to_le_bytes());
            esp -= 4;
            let _ = data.aspace.write_bytes(esp, &sig.to_le_bytes());
            tf.useresp = esp as u32;
            tf.eip = handler_va as u32;
        }
    }
}

fn exit_process(proc: &crate::proc::RcProc, status: i32) {
    if let Some(kernel) = kernel::try_kernel() {
        if proc.state() != ProcState::Zombie {
            kernel.procs.exit(&kernel.sched, proc, status);
        }
        kernel.deschedule_current();
    }
}

/// The terminal path for kernel-mode invariant violations: report,
/// disable interrupts, halt.
pub fn kernel_panic(tf: &TrapFrame, why: &str) -> ! {
    console::set_panicked();
    crate::println!("kernel panic: {}", why);
    crate::println!(
        "vector={} err={:#x} eip={:#x} cs={:#x} eflags={:#x}",
        tf.vector,
        tf.err,
        tf.eip,
        tf.cs,
        tf.eflags
    );
    crate::println!(
        "eax={:#x} ebx={:#x} ecx={:#x} edx={:#x} esi={:#x} edi={:#x} ebp={:#x}",
        tf.eax,
        tf.ebx,
        tf.ecx,
        tf.edx,
        tf.esi,
        tf.edi,
        tf.ebp
    );
    crate::hal::intr_off();
    #[cfg(test)]
    {
        panic!("kernel panic: {}", why);
    }
    #[cfg(not(test))]
    loop {
        crate::hal::halt();
    }
}
