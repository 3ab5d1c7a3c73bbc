//! Hardware devices and the response bus.
//!
//! The machine exposes 16 device ports. Each port's handler address in the
//! interrupt vector table is `port * 4`. A device receives commands
//! synchronously on the engine thread through [`Device::try_send`]; work
//! that completes asynchronously is reported back as a [`bus::Response`] on
//! the shared bus, which the engine drains one response per iteration.
//!
//! Command numbering shared by all devices:
//! - `0` — get device info (handled by the engine via [`Device::info`])
//! - `1` — get device status without performing any action
//! - `2+` — device specific
//!
//! - [`bus`]: the bounded response channel
//! - [`timer`]: one-shot microsecond timer (port 0)
//! - [`power`]: restart / poweroff controller (port 1)
//! - [`mmu`]: memory management unit (port 2)
//! - [`console`]: console I/O (port 3)

pub mod bus;
pub mod console;
pub mod mmu;
pub mod power;
pub mod timer;

use crate::machine::vm::Core;
use self::bus::BusSender;

/// Caller-chosen tag correlating a device request with its response.
pub type InteractionId = u32;

/// Number of device ports addressable by `write`.
pub const NUM_PORTS: usize = 16;

pub const TIMER_PORT: usize = 0;
pub const POWER_PORT: usize = 1;
pub const MMU_PORT: usize = 2;
pub const CONSOLE_PORT: usize = 3;

/// `write` command asking for device info.
pub const CMD_INFO: u32 = 0;
/// `write` command asking for device status.
pub const CMD_STATUS: u32 = 1;

/// Status word a `write` leaves on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotFound,
    Ready,
    Busy,
}

impl Status {
    /// The 32-bit encoding pushed onto the stack.
    pub const fn code(&self) -> u32 {
        match self {
            Status::NotFound => 0x00,
            Status::Ready => 0x01,
            Status::Busy => 0x02,
        }
    }
}

/// Identity a device reports for `write port 0`.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub hwid: u32,
    pub metadata: Vec<u8>,
}

/// Construction data shared by devices that post responses.
pub struct DeviceBase {
    /// Entry in the interrupt vector table associated with this device.
    pub interrupt_addr: u32,
    pub bus: BusSender,
}

/// A hardware peripheral attached to one port.
///
/// `try_send` runs on the engine thread and must not block; a command either
/// completes synchronously or schedules an asynchronous response on the bus.
/// `reset` is a power-cycle notification; `close` ends the device's worker.
pub trait Device: Send {
    fn info(&self) -> DeviceInfo;

    fn try_send(&mut self, core: &mut Core, id: InteractionId, command: u32, data: &[u8])
        -> Status;

    fn reset(&mut self, core: &mut Core);

    fn close(&mut self);
}

/// Marker for an empty port.
pub struct NoDevice;

impl Device for NoDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo::default()
    }

    fn try_send(&mut self, _: &mut Core, _: InteractionId, _: u32, _: &[u8]) -> Status {
        Status::NotFound
    }

    fn reset(&mut self, _: &mut Core) {}

    fn close(&mut self) {}
}
