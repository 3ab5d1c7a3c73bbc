//! Power controller device (port 1).
//!
//! Command 2 restarts the machine; command 3 powers it off. Both act on the
//! whole machine, so the controller latches the request into the core and
//! the engine applies it at the end of the triggering `write` instruction:
//! a restart re-initialises the core state and resets every device, a
//! poweroff closes every device and sets the shutdown outcome.

use crate::machine::devices::{Device, DeviceInfo, InteractionId, Status};
use crate::machine::vm::Core;

/// Restart / poweroff command numbers.
const CMD_RESTART: u32 = 2;
const CMD_POWEROFF: u32 = 3;

/// The action a power command asks the engine to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    Restart,
    Poweroff,
}

pub struct PowerController;

impl PowerController {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PowerController {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for PowerController {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            hwid: 0x02,
            metadata: Vec::new(),
        }
    }

    fn try_send(&mut self, core: &mut Core, _id: InteractionId, command: u32, _data: &[u8]) -> Status {
        match command {
            CMD_RESTART => core.request_power(PowerRequest::Restart),
            CMD_POWEROFF => core.request_power(PowerRequest::Poweroff),
            _ => {}
        }
        Status::Ready
    }

    fn reset(&mut self, _core: &mut Core) {}

    fn close(&mut self) {}
}
