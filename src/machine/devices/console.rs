//! Console I/O device (port 3).
//!
//! Writes are synchronous: command 2 emits one 32-bit code point, command 3
//! emits a byte range read straight out of machine memory. Reads are
//! asynchronous: command 4 enqueues a character request keyed by its
//! interaction id, and a dedicated reader thread (the only code that ever
//! touches stdin) answers each request with a response carrying the 4-byte
//! code point. A full request queue reports busy and posts an I/O error
//! response instead of blocking the engine.

use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;

use crate::machine::devices::bus::Response;
use crate::machine::devices::{Device, DeviceBase, DeviceInfo, InteractionId, Status, CMD_STATUS};
use crate::machine::errors::Fault;
use crate::machine::memory::WORD_BYTES;
use crate::machine::vm::Core;
use crate::warn;

const CMD_WRITE_RUNE: u32 = 2;
const CMD_WRITE_RANGE: u32 = 3;
const CMD_READ_RUNE: u32 = 4;

/// Queue depth for outstanding character reads.
const READ_QUEUE_CAPACITY: usize = 32;

/// Reads one UTF-8 encoded character from the reader.
fn read_rune(input: &mut impl Read) -> std::io::Result<char> {
    let mut first = [0u8; 1];
    input.read_exact(&mut first)?;

    let extra = match first[0] {
        b if b & 0b1000_0000 == 0 => 0,
        b if b & 0b1110_0000 == 0b1100_0000 => 1,
        b if b & 0b1111_0000 == 0b1110_0000 => 2,
        b if b & 0b1111_1000 == 0b1111_0000 => 3,
        _ => return Err(std::io::ErrorKind::InvalidData.into()),
    };

    let mut buf = [0u8; 4];
    buf[0] = first[0];
    input.read_exact(&mut buf[1..1 + extra])?;

    std::str::from_utf8(&buf[..1 + extra])
        .ok()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| std::io::ErrorKind::InvalidData.into())
}

pub struct ConsoleIo {
    base: DeviceBase,
    /// Taken on close; dropping the sender ends the reader thread.
    requests: Option<mpsc::Sender<(u32, InteractionId)>>,
    /// Bumped on reset so queued requests from before the reset are dropped.
    generation: Arc<AtomicU32>,
}

impl ConsoleIo {
    pub fn new(base: DeviceBase) -> Self {
        let (tx, rx) = mpsc::channel::<(u32, InteractionId)>(READ_QUEUE_CAPACITY);
        let generation = Arc::new(AtomicU32::new(0));
        Self::spawn_reader(&base, rx, generation.clone(), std::io::stdin());
        Self {
            base,
            requests: Some(tx),
            generation,
        }
    }

    /// Starts the reader worker on its own OS thread; stdin reads block.
    fn spawn_reader(
        base: &DeviceBase,
        mut rx: mpsc::Receiver<(u32, InteractionId)>,
        generation: Arc<AtomicU32>,
        input: impl Read + Send + 'static,
    ) {
        let bus = base.bus.clone();
        let interrupt_addr = base.interrupt_addr;
        thread::spawn(move || {
            let mut input = input;
            while let Some((request_gen, id)) = rx.blocking_recv() {
                if request_gen != generation.load(Ordering::Acquire) {
                    // Stale request from before a reset.
                    continue;
                }
                match read_rune(&mut input) {
                    Ok(rune) => {
                        if request_gen != generation.load(Ordering::Acquire) {
                            continue;
                        }
                        let data = (rune as u32).to_le_bytes().to_vec();
                        bus.send(Response::new(interrupt_addr, id, data, None));
                    }
                    Err(_) => {
                        bus.send(Response::new(interrupt_addr, id, Vec::new(), Some(Fault::Io)));
                    }
                }
            }
        });
    }
}

impl Device for ConsoleIo {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            hwid: 0x04,
            metadata: Vec::new(),
        }
    }

    fn try_send(&mut self, core: &mut Core, id: InteractionId, command: u32, data: &[u8]) -> Status {
        match command {
            CMD_STATUS => Status::Ready,

            CMD_WRITE_RUNE => {
                let Some(bytes) = data.get(..WORD_BYTES as usize) else {
                    return Status::Busy;
                };
                let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let rune = char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER);
                core.output_rune(rune);
                Status::Ready
            }

            CMD_WRITE_RANGE => {
                let word = WORD_BYTES as usize;
                let Some(header) = data.get(..2 * word) else {
                    return Status::Busy;
                };
                let count = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                let addr = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                match core.memory.slice(addr, count) {
                    Ok(bytes) => {
                        let bytes = bytes.to_vec();
                        core.output_bytes(&bytes);
                        Status::Ready
                    }
                    Err(fault) => {
                        core.raise(fault);
                        Status::Busy
                    }
                }
            }

            CMD_READ_RUNE => {
                let request_gen = self.generation.load(Ordering::Acquire);
                let accepted = match &self.requests {
                    Some(tx) => tx.try_send((request_gen, id)).is_ok(),
                    None => false,
                };
                if accepted {
                    Status::Ready
                } else {
                    warn!("console read queue overflow, interaction {id}");
                    self.base
                        .bus
                        .send(Response::new(self.base.interrupt_addr, id, Vec::new(), Some(Fault::Io)));
                    Status::Busy
                }
            }

            _ => Status::Ready,
        }
    }

    fn reset(&mut self, _core: &mut Core) {
        // Invalidate every queued read request.
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn close(&mut self) {
        self.requests = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_rune_ascii() {
        let mut input = "ab".as_bytes();
        assert_eq!(read_rune(&mut input).unwrap(), 'a');
        assert_eq!(read_rune(&mut input).unwrap(), 'b');
        assert!(read_rune(&mut input).is_err()); // exhausted
    }

    #[test]
    fn read_rune_multibyte() {
        let mut input = "é€𝄞".as_bytes();
        assert_eq!(read_rune(&mut input).unwrap(), 'é');
        assert_eq!(read_rune(&mut input).unwrap(), '€');
        assert_eq!(read_rune(&mut input).unwrap(), '𝄞');
    }

    #[test]
    fn read_rune_rejects_stray_continuation() {
        let mut input = [0x80u8, b'a'].as_slice();
        assert!(read_rune(&mut input).is_err());
    }
}
