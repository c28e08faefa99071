//! StripeKV client
//!
//! Thin asynchronous client over one gateway connection. Requests are
//! correlated by request id through a oneshot map, so any number of
//! operations can be in flight and responses may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use proto::codec::{read_frame, write_frame, FrameError};
use proto::{Message, MessageId, Payload, PeerAddr};
use sk_core::{ConnHandle, InstanceId, Key, RequestId, StripeLocation};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("connection closed before the response arrived")]
    ConnectionClosed,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

type PendingResponses = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Payload>>>>;

/// One gateway connection. Cloneable is not needed; wrap in `Arc` to
/// share across tasks.
pub struct Client {
    instance_id: InstanceId,
    next_request: AtomicU32,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingResponses,
    reader: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Connect to a gateway's application port. `instance_id` must be
    /// unique per client process so the gateway's pending buckets never
    /// collide across clients.
    pub async fn connect(addr: &str, instance_id: InstanceId) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut read_half, write_half) = stream.into_split();
        let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(msg)) => {
                        let waiter = reader_pending.lock().remove(&msg.id.request_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(msg.payload);
                            }
                            None => debug!(
                                request_id = msg.id.request_id,
                                "unmatched response dropped"
                            ),
                        }
                    }
                    Ok(None) => break,
                    Err(FrameError::Malformed(e)) => {
                        warn!("malformed response skipped: {}", e);
                    }
                    Err(e) => {
                        warn!("connection error: {}", e);
                        break;
                    }
                }
            }
            // Wake every waiter with a closed-channel error.
            reader_pending.lock().clear();
        });

        Ok(Self {
            instance_id,
            next_request: AtomicU32::new(1),
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            reader,
        })
    }

    async fn call(&self, payload: Payload) -> Result<Payload, ClientError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let msg = Message::request(
            PeerAddr::App(ConnHandle::new(0, 0)),
            MessageId::new(self.instance_id, request_id),
            payload,
        );
        let result = write_frame(&mut *self.writer.lock().await, &msg).await;
        if let Err(e) = result {
            self.pending.lock().remove(&request_id);
            return Err(e.into());
        }
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    pub async fn get(&self, key: Key) -> Result<Option<Bytes>, ClientError> {
        match self.call(Payload::GetRequest { key }).await? {
            Payload::GetResponse { value, .. } => Ok(value),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn set(&self, key: Key, value: Bytes) -> Result<bool, ClientError> {
        // The gateway resolves the location itself; the placeholder keeps
        // the request shape uniform.
        let loc = StripeLocation {
            list_id: 0,
            chunk_id: 0,
        };
        match self.call(Payload::SetRequest { key, value, loc }).await? {
            Payload::SetResponse { success, .. } => Ok(success),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn update(&self, key: Key, offset: u32, data: Bytes) -> Result<bool, ClientError> {
        let loc = StripeLocation {
            list_id: 0,
            chunk_id: 0,
        };
        match self
            .call(Payload::UpdateRequest {
                key,
                offset,
                data,
                loc,
            })
            .await?
        {
            Payload::UpdateResponse { success, .. } => Ok(success),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn delete(&self, key: Key) -> Result<bool, ClientError> {
        let loc = StripeLocation {
            list_id: 0,
            chunk_id: 0,
        };
        match self.call(Payload::DeleteRequest { key, loc }).await? {
            Payload::DeleteResponse { success, .. } => Ok(success),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal gateway stand-in: answers GET with the key upper-cased and
    /// SET with success, out of order when asked to batch.
    async fn fake_gateway(listener: TcpListener, reorder: bool) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let mut held: Vec<Message> = Vec::new();
        while let Ok(Some(msg)) = read_frame(&mut reader).await {
            let reply = |msg: &Message| {
                let payload = match &msg.payload {
                    Payload::GetRequest { key } => Payload::GetResponse {
                        key: key.clone(),
                        value: Some(Bytes::from(
                            String::from_utf8_lossy(key.as_bytes()).to_uppercase(),
                        )),
                    },
                    Payload::SetRequest { key, .. } => Payload::SetResponse {
                        key: key.clone(),
                        success: true,
                    },
                    Payload::DeleteRequest { key, .. } => Payload::DeleteResponse {
                        key: key.clone(),
                        success: false,
                    },
                    other => panic!("unexpected request: {:?}", other),
                };
                Message::request(PeerAddr::Gateway(1), msg.id, payload)
            };
            if reorder {
                held.push(msg);
                if held.len() == 2 {
                    for msg in held.drain(..).rev() {
                        write_frame(&mut writer, &reply(&msg)).await.unwrap();
                    }
                }
            } else {
                write_frame(&mut writer, &reply(&msg)).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_gateway(listener, false));

        let client = Client::connect(&addr, 100).await.unwrap();
        assert_eq!(
            client.get(Key::from("foo")).await.unwrap(),
            Some(Bytes::from_static(b"FOO"))
        );
        assert!(client
            .set(Key::from("foo"), Bytes::from_static(b"bar"))
            .await
            .unwrap());
        assert!(!client.delete(Key::from("foo")).await.unwrap());
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_gateway(listener, true));

        let client = Arc::new(Client::connect(&addr, 100).await.unwrap());
        let a = {
            let client = client.clone();
            tokio::spawn(async move { client.get(Key::from("aa")).await })
        };
        let b = {
            let client = client.clone();
            tokio::spawn(async move { client.get(Key::from("bb")).await })
        };
        assert_eq!(a.await.unwrap().unwrap(), Some(Bytes::from_static(b"AA")));
        assert_eq!(b.await.unwrap().unwrap(), Some(Bytes::from_static(b"BB")));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accept and immediately drop the connection.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = Client::connect(&addr, 100).await.unwrap();
        let err = client.get(Key::from("foo")).await.unwrap_err();
        // Depending on timing the write itself may fail instead of the
        // waiter being dropped.
        assert!(matches!(
            err,
            ClientError::ConnectionClosed | ClientError::Frame(_)
        ));
    }
}
