//! Message model and transport for StripeKV
//!
//! The wire format is an opaque serialize/parse boundary: logical message
//! structs with serde derives, bincode-encoded behind a length prefix.
//! The [`Transport`] trait abstracts delivery; the in-memory hub backs
//! tests and single-process clusters, the TCP transport backs deployments.

pub mod codec;
pub mod config;
pub mod message;
pub mod tcp;
pub mod transport;

pub use codec::{encode_frame, read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
pub use config::{ClusterConfig, ConfigError, GatewayPeer, LogConfig, ServerPeer, StripeConfig};
pub use message::{
    DegradedLockResult, Message, MessageId, Payload, PeerAddr, ReconstructionMapping,
    HEARTBEAT_OP_DELETE, HEARTBEAT_OP_SET,
};
pub use transport::{InMemoryHub, Transport, TransportError};
