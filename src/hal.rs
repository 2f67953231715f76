//! Collaborator contract.
//!
//! Everything the core needs from the machine but does not own: interrupt
//! flag control, the halt instruction, port I/O, and the terminal driver.
//! On the i686 kernel build these resolve to inline assembly or to symbols
//! exported by the collaborator objects at link time. Under `cargo test`
//! they are host doubles; the port-write double records its traffic so the
//! EOI discipline is observable.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(test)] {
        use std::sync::Mutex;
        use std::sync::atomic::{AtomicBool, Ordering};

        static INTR_FLAG: AtomicBool = AtomicBool::new(false);
        static PORT_LOG: Mutex<Vec<(u16, u8)>> = Mutex::new(Vec::new());
        static CONSOLE_OUT: Mutex<Vec<u8>> = Mutex::new(Vec::new());
        static CONSOLE_IN: Mutex<Vec<u8>> = Mutex::new(Vec::new());

        /// Whether device interrupts are enabled.
        pub fn intr_get() -> bool {
            INTR_FLAG.load(Ordering::Relaxed)
        }

        pub fn intr_on() {
            INTR_FLAG.store(true, Ordering::Relaxed);
        }

        pub fn intr_off() {
            INTR_FLAG.store(false, Ordering::Relaxed);
        }

        /// Idle the CPU until the next interrupt.
        pub fn halt() {
            std::thread::yield_now();
        }

        /// Busy-wait hint inside spin loops.
        pub fn cpu_relax() {
            std::thread::yield_now();
        }

        pub fn outb(port: u16, value: u8) {
            PORT_LOG.lock().unwrap().push((port, value));
        }

        pub fn inb(_port: u16) -> u8 {
            0
        }

        pub fn console_write(bytes: &[u8]) {
            CONSOLE_OUT.lock().unwrap().extend_from_slice(bytes);
        }

        /// Blocking line read from the terminal collaborator.
        pub fn console_read_line(buf: &mut [u8]) -> usize {
            let mut input = CONSOLE_IN.lock().unwrap();
            let upto = input
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| p + 1)
                .unwrap_or(input.len())
                .min(buf.len());
            buf[..upto].copy_from_slice(&input[..upto]);
            input.drain(..upto);
            upto
        }

        /// Test-only: drain the recorded port writes.
        pub fn take_port_log() -> Vec<(u16, u8)> {
            core::mem::take(&mut *PORT_LOG.lock().unwrap())
        }

        static PORT_LOG_USERS: Mutex<()> = Mutex::new(());

        /// Test-only: serializes tests that inspect the port log.
        pub fn port_log_exclusive() -> std::sync::MutexGuard<'static, ()> {
            PORT_LOG_USERS.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Test-only: drain everything printed so far.
        pub fn take_console_output() -> Vec<u8> {
            core::mem::take(&mut *CONSOLE_OUT.lock().unwrap())
        }

        /// Test-only: queue terminal input.
        pub fn push_console_input(bytes: &[u8]) {
            CONSOLE_IN.lock().unwrap().extend_from_slice(bytes);
        }
    } else if #[cfg(target_arch = "x86")] {
        pub fn intr_get() -> bool {
            let eflags: u32;
            unsafe { core::arch::asm!("pushfd; pop {}", out(reg) eflags) };
            eflags & (1 << 9) != 0
        }

        pub fn intr_on() {
            unsafe { core::arch::asm!("sti") };
        }

        pub fn intr_off() {
            unsafe { core::arch::asm!("cli") };
        }

        pub fn halt() {
            unsafe { core::arch::asm!("hlt") };
        }

        pub fn cpu_relax() {
            core::hint::spin_loop();
        }

        pub fn outb(port: u16, value: u8) {
            unsafe { core::arch::asm!("out dx, al", in("dx") port, in("al") value) };
        }

        pub fn inb(port: u16) -> u8 {
            let value: u8;
            unsafe { core::arch::asm!("in al, dx", in("dx") port, out("al") value) };
            value
        }

        extern "C" {
            fn coal_terminal_write(bytes: *const u8, len: usize);
            fn coal_terminal_read_line(buf: *mut u8, len: usize) -> usize;
        }

        pub fn console_write(bytes: &[u8]) {
            unsafe { coal_terminal_write(bytes.as_ptr(), bytes.len()) };
        }

        pub fn console_read_line(buf: &mut [u8]) -> usize {
            unsafe { coal_terminal_read_line(buf.as_mut_ptr(), buf.len()) }
        }
    } else {
        // Foreign-host check builds: the contract exists but has no machine
        // behind it.
        pub fn intr_get() -> bool {
            false
        }
        pub fn intr_on() {}
        pub fn intr_off() {}
        pub fn halt() {
            core::hint::spin_loop();
        }
        pub fn cpu_relax() {
            core::hint::spin_loop();
        }
        pub fn outb(_port: u16, _value: u8) {}
        pub fn inb(_port: u16) -> u8 {
            0
        }
        pub fn console_write(_bytes: &[u8]) {}
        pub fn console_read_line(_buf: &mut [u8]) -> usize {
            0
        }
    }
}
