//! A 32-bit process virtual machine.
//!
//! Provides a two-pass assembler, a hybrid stack/register execution engine
//! with an interrupt vector table, and a set of asynchronous peripherals
//! connected through a response bus.

pub mod machine;
pub mod utils;
