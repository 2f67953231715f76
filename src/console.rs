//! Console output and terminal input.
//!
//! The terminal driver itself is a collaborator; this module owns the
//! spinlocked printer the `print!`/`println!` macros go through, plus
//! the line-read path behind the `read_terminal_line` syscall. Once the
//! kernel has panicked the printer lock is bypassed, so a panic inside
//! a print cannot wedge the report.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal;
use crate::lock::SpinLock;

pub struct Printer;

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        hal::console_write(s.as_bytes());
        Ok(())
    }
}

static PRINTER: SpinLock<Printer> = SpinLock::new("printer", Printer);
static PANICKED: AtomicBool = AtomicBool::new(false);

pub fn set_panicked() {
    PANICKED.store(true, Ordering::Release);
}

pub fn is_panicked() -> bool {
    PANICKED.load(Ordering::Acquire)
}

/// Writes formatted output through the printer lock; after a panic the
/// lock is skipped.
pub fn print_args(args: fmt::Arguments<'_>) {
    if is_panicked() {
        // SAFETY: the kernel is single-threaded from here on; every
        // other path checks the panicked flag before printing.
        let printer = unsafe { &mut *PRINTER.get_mut_raw() };
        let _ = printer.write_fmt(args);
    } else {
        let _ = PRINTER.lock().write_fmt(args);
    }
}

/// Raw byte output for the `puts` and console-write paths.
pub fn write(bytes: &[u8]) {
    if is_panicked() {
        hal::console_write(bytes);
        return;
    }
    let _guard = PRINTER.lock();
    hal::console_write(bytes);
}

/// Blocking line read from the terminal collaborator.
pub fn read_line(buf: &mut [u8]) -> usize {
    hal::console_read_line(buf)
}

/// print! macro prints to the console using the printer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print_args(format_args!($($arg)*))
    };
}

/// println! macro prints to the console using the printer.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
