//! Transport abstraction and the in-memory hub
//!
//! The hub routes messages between registered peers over tokio channels.
//! It backs tests (with explicit disconnect injection) and single-process
//! clusters; the TCP transport provides the same contract across hosts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::{Message, PeerAddr};

/// Inbound queue capacity per registered peer
pub const PEER_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is disconnected")]
    Disconnected(PeerAddr),
    #[error("peer {0} is not registered")]
    Unknown(PeerAddr),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: PeerAddr, msg: Message) -> Result<(), TransportError>;
}

/// In-process message hub: every peer registers and receives its inbound
/// queue; sends are routed by `PeerAddr`.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    routes: Arc<RwLock<HashMap<PeerAddr, mpsc::Sender<Message>>>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer; returns its inbound message queue.
    pub fn register(&self, peer: PeerAddr) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        self.routes.write().insert(peer, tx);
        rx
    }

    /// Drop a peer's route; subsequent sends fail with `Disconnected`.
    /// Used both for real teardown and for failure injection in tests.
    pub fn disconnect(&self, peer: PeerAddr) {
        self.routes.write().remove(&peer);
        debug!(%peer, "peer disconnected from hub");
    }

    pub fn is_registered(&self, peer: PeerAddr) -> bool {
        self.routes.read().contains_key(&peer)
    }
}

#[async_trait]
impl Transport for InMemoryHub {
    async fn send(&self, target: PeerAddr, msg: Message) -> Result<(), TransportError> {
        let tx = self
            .routes
            .read()
            .get(&target)
            .cloned()
            .ok_or(TransportError::Disconnected(target))?;
        tx.send(msg)
            .await
            .map_err(|_| TransportError::Disconnected(target))
    }
}
