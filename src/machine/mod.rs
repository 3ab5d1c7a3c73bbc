//! The virtual machine: assembler, memory, execution engine, and devices.
//!
//! # Architecture
//!
//! - **Registers**: 32 general 32-bit registers (r0 = program counter,
//!   r1 = stack pointer, r2 = frame pointer) plus 8 special registers
//!   (sr32 = privilege mode, sr33 = heap base)
//! - **Instruction format**: fixed 8 bytes, little-endian
//! - **Memory**: one flat 64 KiB byte array holding the interrupt vector
//!   table, the program image, and a downward-growing stack
//! - **Devices**: asynchronous peripherals posting responses on a shared bus
//!
//! # Modules
//!
//! - [`isa`]: opcode table and classification
//! - [`instruction`]: the 8-byte instruction word
//! - [`assembler`]: assembly source to instruction compilation
//! - [`memory`]: flat memory and the active-segment window
//! - [`vm`]: the execution engine
//! - [`devices`]: response bus, timer, power, MMU, and console peripherals
//! - [`debug`]: printable machine state for the single-step debugger
//! - [`errors`]: error taxonomy

pub mod assembler;
pub mod debug;
pub mod devices;
pub mod errors;
pub mod instruction;
pub mod isa;
pub mod memory;
pub mod vm;
