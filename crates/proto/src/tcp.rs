//! TCP transport
//!
//! One writer task per remote peer fed by a bounded channel; an accept
//! loop turns inbound connections into messages on a shared queue.
//! Reliable, ordered, per-connection byte streams are all this layer
//! assumes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::{read_frame, write_frame, FrameError};
use crate::message::{Message, PeerAddr};
use crate::transport::{Transport, TransportError, PEER_CHANNEL_CAPACITY};

/// TCP-backed transport with static peer addressing.
#[derive(Clone)]
pub struct TcpTransport {
    addrs: Arc<HashMap<PeerAddr, String>>,
    senders: Arc<RwLock<HashMap<PeerAddr, mpsc::Sender<Message>>>>,
}

impl TcpTransport {
    pub fn new(addrs: HashMap<PeerAddr, String>) -> Self {
        Self {
            addrs: Arc::new(addrs),
            senders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Accept loop: forwards every inbound message to `inbound`. A parse
    /// failure skips the message; a transport failure drops only that
    /// connection.
    pub async fn serve(
        listen_addr: &str,
        inbound: mpsc::Sender<Message>,
    ) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(%listen_addr, "transport listening");
        Ok(tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        continue;
                    }
                };
                debug!(%remote, "inbound connection");
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    let mut reader = stream;
                    loop {
                        match read_frame(&mut reader).await {
                            Ok(Some(msg)) => {
                                if inbound.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => return,
                            Err(FrameError::Malformed(e)) => {
                                // Only the malformed message is discarded;
                                // later pipelined frames still parse.
                                warn!(%remote, "malformed message skipped: {}", e);
                            }
                            Err(e) => {
                                warn!(%remote, "connection error: {}", e);
                                return;
                            }
                        }
                    }
                });
            }
        }))
    }

    /// Lazily connect to a peer and spawn its writer task.
    fn sender_for(&self, target: PeerAddr) -> Result<mpsc::Sender<Message>, TransportError> {
        if let Some(tx) = self.senders.read().get(&target) {
            return Ok(tx.clone());
        }
        let addr = self
            .addrs
            .get(&target)
            .cloned()
            .ok_or(TransportError::Unknown(target))?;

        let (tx, mut rx) = mpsc::channel::<Message>(PEER_CHANNEL_CAPACITY);
        self.senders.write().insert(target, tx.clone());

        let senders = self.senders.clone();
        tokio::spawn(async move {
            let mut stream: Option<TcpStream> = None;
            while let Some(msg) = rx.recv().await {
                if stream.is_none() {
                    match TcpStream::connect(&addr).await {
                        Ok(s) => stream = Some(s),
                        Err(e) => {
                            warn!(%target, %addr, "connect failed: {}", e);
                            break;
                        }
                    }
                }
                if let Some(s) = stream.as_mut() {
                    if let Err(e) = write_frame(s, &msg).await {
                        warn!(%target, "send failed: {}", e);
                        break;
                    }
                }
            }
            // Writer gone; next send reconnects through a fresh task.
            senders.write().remove(&target);
            debug!(%target, "writer task stopped");
        });

        Ok(tx)
    }

    /// Drop the writer for a peer so the next send reconnects.
    pub fn reset_peer(&self, target: PeerAddr) {
        self.senders.write().remove(&target);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: PeerAddr, msg: Message) -> Result<(), TransportError> {
        let tx = self.sender_for(target)?;
        tx.send(msg)
            .await
            .map_err(|_| TransportError::Disconnected(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, Payload};
    use sk_core::Key;

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let _server = TcpTransport::serve("127.0.0.1:39471", inbound_tx)
            .await
            .unwrap();

        let mut addrs = HashMap::new();
        addrs.insert(PeerAddr::Server(0), "127.0.0.1:39471".to_string());
        let transport = TcpTransport::new(addrs);

        let msg = Message::request(
            PeerAddr::Gateway(1),
            MessageId::new(1, 9),
            Payload::GetRequest {
                key: Key::from("foo"),
            },
        );
        transport
            .send(PeerAddr::Server(0), msg.clone())
            .await
            .unwrap();

        let got = inbound_rx.recv().await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let transport = TcpTransport::new(HashMap::new());
        let msg = Message::request(
            PeerAddr::Gateway(1),
            MessageId::new(1, 1),
            Payload::GetRequest {
                key: Key::from("x"),
            },
        );
        assert!(matches!(
            transport.send(PeerAddr::Server(9), msg).await,
            Err(TransportError::Unknown(_))
        ));
    }
}
