//! Logical message definitions
//!
//! Each variant carries exactly the fields the receiving worker needs;
//! byte layout is left to the codec. Response variants echo the key so a
//! late or duplicate response can still be matched (or safely discarded)
//! against the pending table.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use coding::SealState;
use sk_core::{ConnHandle, InstanceId, Key, Metadata, RequestId, ServerId, StripeLocation};

/// Addressable protocol participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerAddr {
    Coordinator,
    Gateway(InstanceId),
    Server(ServerId),
    /// An application connection local to one gateway
    App(ConnHandle),
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Coordinator => write!(f, "coordinator"),
            PeerAddr::Gateway(id) => write!(f, "gateway-{}", id),
            PeerAddr::Server(id) => write!(f, "server-{}", id),
            PeerAddr::App(h) => write!(f, "app-{}", h),
        }
    }
}

/// Sender-scoped correlation id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub instance_id: InstanceId,
    pub request_id: RequestId,
}

impl MessageId {
    pub fn new(instance_id: InstanceId, request_id: RequestId) -> Self {
        Self {
            instance_id,
            request_id,
        }
    }
}

/// `original[i]` chunk slot is served by the `reconstructed[i]` slot while
/// the original's server is down. Parallel arrays, as in the lock grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionMapping {
    pub original: Vec<(u32, u32)>,
    pub reconstructed: Vec<(u32, u32)>,
}

impl ReconstructionMapping {
    /// Redirected slot for an original (list, chunk), if any.
    pub fn redirect(&self, list_id: u32, chunk_id: u32) -> Option<(u32, u32)> {
        self.original
            .iter()
            .position(|&(l, c)| l == list_id && c == chunk_id)
            .map(|i| self.reconstructed[i])
    }
}

/// Key ops carried by heartbeats
pub const HEARTBEAT_OP_SET: u8 = 0;
pub const HEARTBEAT_OP_DELETE: u8 = 1;

/// Coordinator's answer to a degraded lock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradedLockResult {
    /// Lock granted now; the requester triggers reconstruction.
    IsLocked {
        stripe_id: u32,
        mapping: ReconstructionMapping,
        sealed: bool,
    },
    /// Already locked by an earlier request; reuse its mapping.
    WasLocked {
        stripe_id: u32,
        mapping: ReconstructionMapping,
        sealed: bool,
    },
    /// Chunk permanently relocated; retry as a normal operation there.
    Remapped { remapped: (u32, u32) },
    /// Key confirmed absent even accounting for the failure.
    NotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    // --- application-facing operations (client <-> gateway) ---
    GetRequest {
        key: Key,
    },
    GetResponse {
        key: Key,
        value: Option<Bytes>,
    },
    SetRequest {
        key: Key,
        value: Bytes,
        loc: StripeLocation,
    },
    SetResponse {
        key: Key,
        success: bool,
    },
    UpdateRequest {
        key: Key,
        offset: u32,
        data: Bytes,
        loc: StripeLocation,
    },
    UpdateResponse {
        key: Key,
        offset: u32,
        length: u32,
        success: bool,
    },
    DeleteRequest {
        key: Key,
        loc: StripeLocation,
    },
    DeleteResponse {
        key: Key,
        success: bool,
    },

    // --- degraded path (gateway <-> coordinator, gateway <-> server) ---
    DegradedLockRequest {
        key: Key,
        mapping: ReconstructionMapping,
    },
    /// SET whose data slot is down: register a relocation for the key so
    /// every later operation is steered to the same replacement slot.
    RemapLockRequest {
        key: Key,
        remapped: (u32, u32),
    },
    /// Echoes the authoritative slot (an earlier registration wins).
    RemapLockResponse {
        key: Key,
        remapped: (u32, u32),
        success: bool,
    },
    DegradedLockResponse {
        key: Key,
        result: DegradedLockResult,
    },
    DegradedGetRequest {
        key: Key,
        stripe_id: u32,
        mapping: ReconstructionMapping,
        sealed: bool,
    },
    DegradedUpdateRequest {
        key: Key,
        offset: u32,
        data: Bytes,
        stripe_id: u32,
        mapping: ReconstructionMapping,
        sealed: bool,
    },
    DegradedDeleteRequest {
        key: Key,
        stripe_id: u32,
        mapping: ReconstructionMapping,
        sealed: bool,
    },

    // --- server <-> server ---
    GetChunkRequest {
        metadata: Metadata,
    },
    GetChunkResponse {
        metadata: Metadata,
        seal: SealState,
        count: u32,
        size: u32,
        data: Option<Bytes>,
    },
    /// XOR delta against one record's value bytes. Applies identically to
    /// an unsealed parity record copy and to a sealed parity chunk.
    ParityUpdateRequest {
        key: Key,
        metadata: Metadata,
        chunk_offset: u32,
        value_offset: u32,
        xor_delta: Bytes,
    },
    ParityUpdateResponse {
        key: Key,
        success: bool,
    },
    /// Record removal; `record` is the full serialized record so a sealed
    /// parity chunk can XOR it out.
    ParityDeleteRequest {
        key: Key,
        metadata: Metadata,
        chunk_offset: u32,
        record: Bytes,
    },
    ParityDeleteResponse {
        key: Key,
        success: bool,
    },
    SealChunkRequest {
        metadata: Metadata,
        count: u32,
        size: u32,
        data: Bytes,
    },
    SealChunkResponse {
        metadata: Metadata,
        success: bool,
    },

    // --- coordinator control plane ---
    RegisterRequest {
        peer: PeerAddr,
    },
    RegisterResponse {
        success: bool,
    },
    Heartbeat {
        sealed: Vec<Metadata>,
        keys: Vec<(Key, Metadata, u8)>,
        is_last: bool,
    },
    ServerStateNotify {
        server: ServerId,
        up: bool,
    },
    ReconstructionRequest {
        list_id: u32,
        chunk_id: u32,
        stripe_ids: Vec<u32>,
    },
    ReconstructionResponse {
        list_id: u32,
        chunk_id: u32,
        num_stripes: u32,
        success: bool,
    },
    ReleaseDegradedLockRequest {
        chunks: Vec<Metadata>,
    },
    ReleaseDegradedLockResponse {
        count: u32,
    },
}

/// A framed message: who sent it, its correlation id, and the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: PeerAddr,
    pub id: MessageId,
    /// Parent ids link a downstream request back to the upstream request
    /// that spawned it; zero when there is no parent hop.
    pub parent_id: MessageId,
    pub timestamp: u32,
    pub payload: Payload,
}

impl Message {
    pub fn request(from: PeerAddr, id: MessageId, payload: Payload) -> Self {
        Self {
            from,
            id,
            parent_id: MessageId::new(0, 0),
            timestamp: 0,
            payload,
        }
    }

    pub fn with_parent(mut self, parent_id: MessageId) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }
}
