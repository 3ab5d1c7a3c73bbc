//! Printable machine state for the single-step debugger and for terminal
//! error reports.

use std::fmt::{Display, Formatter};

use crate::machine::assembler::revert_escape_sequences;
use crate::machine::errors::VmError;
use crate::machine::instruction::{Instruction, INSTRUCTION_BYTES};
use crate::machine::vm::{Machine, REG_SP};

/// Longest stack slice the state view prints.
const STACK_VIEW_BYTES: u32 = 64;

impl Machine {
    /// Formats the instruction at `addr`: the source line as first read in
    /// when debug symbols are available, the decoded instruction otherwise.
    pub fn instruction_string_at(&self, addr: u32) -> Option<String> {
        if let Some(sym) = &self.debug_sym {
            if let Some(line) = sym.source.get(&addr) {
                return Some(line.clone());
            }
        }
        let slice = self.core.memory.slice(addr, INSTRUCTION_BYTES).ok()?;
        let mut bytes = [0u8; INSTRUCTION_BYTES as usize];
        bytes.copy_from_slice(slice);
        Some(Instruction::decode(bytes).to_string())
    }

    /// One-line terminal report naming the instruction that failed. The
    /// program counter has already advanced past it, so back up one slot.
    pub fn error_report(&self, err: &VmError) -> String {
        let pc = self.pc().saturating_sub(INSTRUCTION_BYTES);
        match self.instruction_string_at(pc) {
            Some(instr) => format!("{err} at instruction 0x{pc:04X}: {instr}"),
            None => err.to_string(),
        }
    }
}

impl Display for Machine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let pc = self.pc();
        if let Some(instr) = self.instruction_string_at(pc) {
            writeln!(f, "  next instruction> 0x{pc:04X}: {instr}")?;
        }

        writeln!(f, "  registers> {:?}", self.registers())?;

        let sp = self.registers()[REG_SP];
        let (_, seg_end) = self.core.memory.window();
        let available = seg_end.saturating_sub(sp);
        let shown = available.min(STACK_VIEW_BYTES);
        match self.core.memory.slice(sp, shown) {
            Ok(bytes) if available > shown => writeln!(f, "  stack> {bytes:?} …")?,
            Ok(bytes) => writeln!(f, "  stack> {bytes:?}")?,
            Err(_) => writeln!(f, "  stack> <pointer out of bounds: 0x{sp:04X}>")?,
        }

        if let Some(captured) = &self.captured {
            writeln!(f, "  output> {}", revert_escape_sequences(&captured.contents()))?;
        }
        Ok(())
    }
}
