//! Length-prefixed bincode frame codec
//!
//! `[u32 BE length][bincode(Message)]`. A malformed body is reported as
//! `FrameError::Malformed` after the full frame was consumed, so the
//! caller can skip the bad message and keep the connection: buffers may
//! contain multiple pipelined messages and only the malformed one is
//! dropped.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Upper bound on one frame (covers a full chunk plus headers).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("malformed message body: {0}")]
    Malformed(String),
}

/// Encode a message into a ready-to-send frame.
pub fn encode_frame(msg: &Message) -> Result<Bytes, FrameError> {
    let body = bincode::serialize(msg).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(Bytes::from(out))
}

/// Decode a frame body (without the length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message, FrameError> {
    bincode::deserialize(body).map_err(|e| FrameError::Malformed(e.to_string()))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), FrameError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. `Ok(None)` on clean EOF before a frame starts.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode_body(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, Payload, PeerAddr};
    use sk_core::Key;

    fn sample() -> Message {
        Message::request(
            PeerAddr::Gateway(1),
            MessageId::new(1, 42),
            Payload::GetRequest {
                key: Key::from("foo"),
            },
        )
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let msg = sample();
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let got = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(got, msg);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_skippable() {
        let msg = sample();
        let good = encode_frame(&msg).unwrap();

        // A bad frame followed by a good one: the reader reports the bad
        // body but the stream stays aligned for the next frame.
        let mut stream = Vec::new();
        stream.extend_from_slice(&4u32.to_be_bytes());
        stream.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        stream.extend_from_slice(&good);

        let mut cursor = std::io::Cursor::new(stream);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Malformed(_))
        ));
        let got = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::TooLarge(_))
        ));
    }
}
