//! The response bus: the single channel from all devices to the engine.
//!
//! A bounded multi-producer channel whose consumer side supports both the
//! engine's per-iteration non-blocking poll and the blocking wait `halt`
//! needs. Producers never block: a full bus makes `send` fail, and the
//! device reports busy instead of stalling the engine thread.

use tokio::sync::mpsc;

use crate::machine::devices::InteractionId;
use crate::machine::errors::Fault;

/// A completed device interaction, posted by a device worker.
#[derive(Debug)]
pub struct Response {
    /// IVT entry associated with the posting device.
    pub interrupt_addr: u32,
    pub id: InteractionId,
    pub data: Vec<u8>,
    /// Set when the device is signalling a failed operation.
    pub device_err: Option<Fault>,
}

impl Response {
    pub fn new(interrupt_addr: u32, id: InteractionId, data: Vec<u8>, device_err: Option<Fault>) -> Self {
        Self {
            interrupt_addr,
            id,
            data,
            device_err,
        }
    }
}

/// Producer handle held by each device.
#[derive(Clone)]
pub struct BusSender {
    tx: mpsc::Sender<Response>,
}

impl BusSender {
    /// Posts a response without blocking. Returns false when the bus is full.
    pub fn send(&self, response: Response) -> bool {
        self.tx.try_send(response).is_ok()
    }
}

/// Consumer side owned by the engine.
pub struct ResponseBus {
    // Keeping one sender alive here means receives never observe a closed
    // channel while the machine exists.
    tx: mpsc::Sender<Response>,
    rx: mpsc::Receiver<Response>,
    peeked: Option<Response>,
}

impl ResponseBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx,
            peeked: None,
        }
    }

    pub fn sender(&self) -> BusSender {
        BusSender {
            tx: self.tx.clone(),
        }
    }

    /// Takes the next pending response, if any. Responses are delivered in
    /// bus-arrival order, one per engine iteration.
    pub fn try_receive(&mut self) -> Option<Response> {
        self.peeked.take().or_else(|| self.rx.try_recv().ok())
    }

    /// Blocks the engine thread until a response is pending, without
    /// consuming it; the next `try_receive` returns it. Used by `halt`.
    pub fn wait(&mut self) {
        if self.peeked.is_none() {
            self.peeked = self.rx.blocking_recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_arrival_order() {
        let mut bus = ResponseBus::new(4);
        let sender = bus.sender();
        assert!(sender.send(Response::new(0x00, 1, vec![], None)));
        assert!(sender.send(Response::new(0x04, 2, vec![], None)));
        assert_eq!(bus.try_receive().unwrap().id, 1);
        assert_eq!(bus.try_receive().unwrap().id, 2);
        assert!(bus.try_receive().is_none());
    }

    #[test]
    fn full_bus_rejects_instead_of_blocking() {
        let mut bus = ResponseBus::new(1);
        let sender = bus.sender();
        assert!(sender.send(Response::new(0, 1, vec![], None)));
        assert!(!sender.send(Response::new(0, 2, vec![], None)));
        assert_eq!(bus.try_receive().unwrap().id, 1);
        assert!(sender.send(Response::new(0, 3, vec![], None)));
    }

    #[test]
    fn wait_leaves_response_queued() {
        let mut bus = ResponseBus::new(4);
        let sender = bus.sender();
        sender.send(Response::new(0, 9, vec![1, 2], None));
        bus.wait();
        let response = bus.try_receive().unwrap();
        assert_eq!(response.id, 9);
        assert_eq!(response.data, vec![1, 2]);
    }
}
