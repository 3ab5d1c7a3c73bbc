//! System timer device (port 0).
//!
//! Command 2 arms a one-shot timer whose microsecond duration comes from
//! the 4-byte payload; arming again replaces any pending timer. Expiry
//! posts a response with no data on the bus. The countdown runs on its own
//! worker task so the engine never waits on it.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::machine::devices::bus::Response;
use crate::machine::devices::{Device, DeviceBase, DeviceInfo, InteractionId, Status, CMD_STATUS};
use crate::machine::errors::Fault;
use crate::machine::vm::Core;

enum TimerCommand {
    Arm {
        duration: Duration,
        id: InteractionId,
    },
    Cancel,
}

pub struct SystemTimer {
    base: DeviceBase,
    /// Taken on close; dropping the sender ends the worker.
    commands: Option<mpsc::Sender<TimerCommand>>,
}

impl SystemTimer {
    pub fn new(base: DeviceBase, runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::channel::<TimerCommand>(4);
        let bus = base.bus.clone();
        let interrupt_addr = base.interrupt_addr;

        runtime.spawn(async move {
            let mut armed: Option<(Instant, InteractionId)> = None;
            loop {
                match armed {
                    Some((deadline, id)) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {
                                armed = None;
                                // No payload: receiving this response at all
                                // means the timer elapsed.
                                bus.send(Response::new(interrupt_addr, id, Vec::new(), None));
                            }
                            command = rx.recv() => match command {
                                Some(TimerCommand::Arm { duration, id }) => {
                                    armed = Some((Instant::now() + duration, id));
                                }
                                Some(TimerCommand::Cancel) => armed = None,
                                None => return,
                            }
                        }
                    }
                    None => match rx.recv().await {
                        Some(TimerCommand::Arm { duration, id }) => {
                            armed = Some((Instant::now() + duration, id));
                        }
                        Some(TimerCommand::Cancel) => {}
                        None => return,
                    },
                }
            }
        });

        Self {
            base,
            commands: Some(tx),
        }
    }

    fn send_command(&self, command: TimerCommand) -> bool {
        match &self.commands {
            Some(tx) => tx.try_send(command).is_ok(),
            None => false,
        }
    }
}

impl Device for SystemTimer {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            hwid: 0x01,
            metadata: Vec::new(),
        }
    }

    fn try_send(&mut self, _core: &mut Core, id: InteractionId, command: u32, data: &[u8]) -> Status {
        if command == CMD_STATUS {
            return Status::Ready;
        }

        let Some(bytes) = data.get(..4) else {
            // Malformed arm request: surface it as an I/O error response.
            self.base
                .bus
                .send(Response::new(self.base.interrupt_addr, id, Vec::new(), Some(Fault::Io)));
            return Status::Busy;
        };
        let micros = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

        let accepted = self.send_command(TimerCommand::Arm {
            duration: Duration::from_micros(micros as u64),
            id,
        });
        if accepted {
            Status::Ready
        } else {
            Status::Busy
        }
    }

    fn reset(&mut self, _core: &mut Core) {
        self.send_command(TimerCommand::Cancel);
    }

    fn close(&mut self) {
        self.commands = None;
    }
}
