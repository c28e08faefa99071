//! Gateway front end
//!
//! Accepts application connections, pumps their frames into the worker
//! event queues, and writes responses back. Peer messages (coordinator
//! and storage servers) arrive through the transport's accept loop and
//! are dispatched to the same workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::worker::{GatewayEvent, GatewayWorker};
use proto::codec::{read_frame, write_frame, FrameError};
use proto::transport::PEER_CHANNEL_CAPACITY;
use proto::{Message, MessageId, Payload, PeerAddr};

pub struct GatewayServer {
    ctx: Arc<ServiceContext>,
    workers: Vec<mpsc::Sender<GatewayEvent>>,
    next_worker: AtomicUsize,
}

impl GatewayServer {
    /// Spawn the worker tasks and return the server front end.
    pub fn start(ctx: Arc<ServiceContext>) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let mut senders = Vec::new();
        let mut handles = Vec::new();
        for worker_id in 0..ctx.config.gateway.workers {
            let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
            senders.push(tx);
            let worker = GatewayWorker::new(ctx.clone(), worker_id);
            handles.push(tokio::spawn(worker.run(rx)));
        }
        (
            Arc::new(Self {
                ctx,
                workers: senders,
                next_worker: AtomicUsize::new(0),
            }),
            handles,
        )
    }

    async fn dispatch(&self, event: GatewayEvent) {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[n].send(event).await.is_err() {
            warn!(worker = n, "worker queue closed, event dropped");
        }
    }

    /// Forward inbound peer messages to the workers.
    pub fn spawn_peer_pump(self: &Arc<Self>, mut inbound: mpsc::Receiver<Message>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                server.dispatch(GatewayEvent::Peer(msg)).await;
            }
        })
    }

    /// Announce this gateway to the coordinator.
    pub async fn register_with_coordinator(&self) {
        let id = MessageId::new(self.ctx.instance_id, self.ctx.id_gen.next(0));
        let msg = Message::request(
            PeerAddr::Gateway(self.ctx.instance_id),
            id,
            Payload::RegisterRequest {
                peer: PeerAddr::Gateway(self.ctx.instance_id),
            },
        );
        if let Err(e) = self.ctx.transport.send(PeerAddr::Coordinator, msg).await {
            warn!("coordinator registration failed: {}", e);
        }
    }

    /// Application accept loop.
    pub async fn serve_apps(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(&self.ctx.config.gateway.listen_addr).await?;
        info!(listen_addr = %self.ctx.config.gateway.listen_addr, "gateway listening");
        let server = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                debug!(%remote, "application connected");
                let server = server.clone();
                tokio::spawn(async move {
                    server.serve_connection(stream).await;
                });
            }
        }))
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Message>(PEER_CHANNEL_CAPACITY);
        let conn = self.ctx.conns.register(tx);

        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    debug!("connection write failed: {}", e);
                    return;
                }
            }
        });

        loop {
            match read_frame(&mut reader).await {
                Ok(Some(msg)) => {
                    self.dispatch(GatewayEvent::App { conn, msg }).await;
                }
                Ok(None) => break,
                Err(FrameError::Malformed(e)) => {
                    warn!(%conn, "malformed application message skipped: {}", e);
                }
                Err(e) => {
                    debug!(%conn, "connection error: {}", e);
                    break;
                }
            }
        }
        self.ctx.conns.unregister(conn);
        write_task.abort();
        debug!(%conn, "application disconnected");
    }
}
