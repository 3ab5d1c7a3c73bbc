//! Memory management unit (port 2).
//!
//! Command 2 stores an 8-byte `(min_addr, max_addr)` window for
//! unprivileged execution. Command 3 recomputes the active segment from the
//! current privilege mode: privileged code sees all of memory with a zero
//! stack offset, unprivileged code sees the stored window with the stack
//! offset at its base. The engine issues command 3 itself whenever the mode
//! register changes.

use crate::machine::devices::{Device, DeviceInfo, InteractionId, Status};
use crate::machine::memory::WORD_BYTES;
use crate::machine::vm::Core;

const CMD_SET_BOUNDS: u32 = 2;
const CMD_REFRESH: u32 = 3;

pub struct MemoryManagement {
    min_addr: u32,
    max_addr: u32,
}

impl MemoryManagement {
    pub fn new(memory_len: u32) -> Self {
        Self {
            min_addr: 0,
            max_addr: memory_len,
        }
    }

    /// Applies the segment implied by the current mode.
    fn update_bounds(&self, core: &mut Core) {
        if core.mode() == 0 {
            core.memory.reset_window();
        } else {
            core.memory.set_window(self.min_addr, self.max_addr);
        }
    }
}

impl Device for MemoryManagement {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            hwid: 0x03,
            metadata: Vec::new(),
        }
    }

    fn try_send(&mut self, core: &mut Core, _id: InteractionId, command: u32, data: &[u8]) -> Status {
        match command {
            CMD_SET_BOUNDS => {
                let word = WORD_BYTES as usize;
                if data.len() < 2 * word {
                    return Status::Busy;
                }
                self.min_addr = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.max_addr = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                self.update_bounds(core);
            }
            CMD_REFRESH => self.update_bounds(core),
            _ => {}
        }
        Status::Ready
    }

    fn reset(&mut self, core: &mut Core) {
        self.min_addr = 0;
        self.max_addr = core.memory.len();
        self.update_bounds(core);
    }

    fn close(&mut self) {}
}
