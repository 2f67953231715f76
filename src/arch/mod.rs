//! Machine-dependent definitions.
//!
//! Only the i686 backend exists; the register layouts are plain data and
//! compile everywhere so the dispatch logic above them stays testable.

pub mod x86;

pub use x86::{Context, TrapFrame};
