//! Application connection registry
//!
//! Slab of connection slots addressed by [`ConnHandle`]. A slot's
//! generation is bumped on release, so a handle held by a pending entry
//! can never deliver to a newer connection reusing the same index.

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use proto::Message;
use sk_core::ConnHandle;

struct Slot {
    generation: u32,
    sender: Option<mpsc::Sender<Message>>,
}

#[derive(Default)]
pub struct ConnRegistry {
    slots: RwLock<Vec<Slot>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue; returns its handle.
    pub fn register(&self, sender: mpsc::Sender<Message>) -> ConnHandle {
        let mut slots = self.slots.write();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.sender.is_none() {
                slot.generation += 1;
                slot.sender = Some(sender);
                return ConnHandle::new(index as u32, slot.generation);
            }
        }
        slots.push(Slot {
            generation: 1,
            sender: Some(sender),
        });
        ConnHandle::new(slots.len() as u32 - 1, 1)
    }

    pub fn unregister(&self, handle: ConnHandle) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation {
                slot.sender = None;
            }
        }
    }

    fn sender(&self, handle: ConnHandle) -> Option<mpsc::Sender<Message>> {
        let slots = self.slots.read();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.sender.clone()
    }

    /// Deliver a message to a connection. A stale or closed handle is not
    /// an error: the client is gone and the response is dropped.
    pub async fn send(&self, handle: ConnHandle, msg: Message) -> bool {
        match self.sender(handle) {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => {
                debug!(%handle, "response dropped, connection gone");
                false
            }
        }
    }
}
