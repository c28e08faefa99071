//! Server-side pending state
//!
//! Three kinds of in-flight bookkeeping live here: deferred gateway
//! replies waiting on parity acks, shard-gathering jobs for chunk
//! reconstruction, and per-slot progress of coordinator-driven rebuild
//! batches.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use coding::SealState;
use proto::{MessageId, PeerAddr};
use sk_core::{InstanceId, Key, Metadata, PendingIdentifier, PendingMap, PendingPayload, RequestId};

pub type Pid = PendingIdentifier<PeerAddr>;

/// Gateway reply for an UPDATE, parked until every parity server acks.
#[derive(Debug, Clone)]
pub struct DeferredUpdate {
    pub key: Key,
    pub offset: u32,
    pub length: u32,
}

impl PendingPayload for DeferredUpdate {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// Gateway reply for a DELETE, parked until every parity server acks.
#[derive(Debug, Clone)]
pub struct DeferredDelete {
    pub key: Key,
}

impl PendingPayload for DeferredDelete {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// One shard answer gathered during reconstruction.
#[derive(Debug, Clone)]
pub struct ShardData {
    pub seal: SealState,
    pub count: u32,
    pub size: u32,
    pub data: Option<Bytes>,
}

/// Why a chunk is being reconstructed.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Degraded operation on one key; waiters drain when the chunk exists.
    DegradedKey { key: Key },
    /// Stripe of a coordinator-assigned slot rebuild.
    SlotRebuild { parent: MessageId },
}

/// Shard-gathering state for one chunk reconstruction.
pub struct ReconstructionJob {
    pub target: Metadata,
    pub kind: JobKind,
    /// Indexed by chunk slot; None until (or unless) that slot answers.
    pub shards: Vec<Option<ShardData>>,
    /// Which slots have reported, so duplicates never double-count.
    pub recorded: Vec<bool>,
    pub awaiting: usize,
}

#[derive(Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<(InstanceId, RequestId), ReconstructionJob>>,
}

impl JobTable {
    pub fn insert(&self, instance_id: InstanceId, request_id: RequestId, job: ReconstructionJob) {
        self.jobs.lock().insert((instance_id, request_id), job);
    }

    /// Record one slot's answer (None when the slot cannot answer) and
    /// return the finished job once every awaited slot reported.
    pub fn record(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
        slot: u32,
        shard: Option<ShardData>,
    ) -> Option<ReconstructionJob> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&(instance_id, request_id))?;
        let index = slot as usize;
        if index >= job.shards.len() || job.recorded[index] {
            return None;
        }
        job.recorded[index] = true;
        job.shards[index] = shard;
        job.awaiting -= 1;
        if job.awaiting == 0 {
            return jobs.remove(&(instance_id, request_id));
        }
        None
    }

    pub fn remove(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
    ) -> Option<ReconstructionJob> {
        self.jobs.lock().remove(&(instance_id, request_id))
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

/// Per-slot progress of a coordinator rebuild batch.
pub struct BatchProgress {
    pub parent: MessageId,
    pub list_id: u32,
    pub chunk_id: u32,
    pub remaining: u32,
    pub failed: bool,
    pub total: u32,
}

#[derive(Default)]
pub struct BatchTable {
    batches: Mutex<HashMap<(u32, u32), BatchProgress>>,
}

impl BatchTable {
    pub fn insert(&self, progress: BatchProgress) {
        self.batches
            .lock()
            .insert((progress.list_id, progress.chunk_id), progress);
    }

    /// Mark one stripe of the batch done; returns the whole batch once
    /// its last stripe completes.
    pub fn complete_stripe(
        &self,
        list_id: u32,
        chunk_id: u32,
        success: bool,
    ) -> Option<BatchProgress> {
        let mut batches = self.batches.lock();
        let progress = batches.get_mut(&(list_id, chunk_id))?;
        progress.failed |= !success;
        progress.remaining = progress.remaining.saturating_sub(1);
        if progress.remaining == 0 {
            return batches.remove(&(list_id, chunk_id));
        }
        None
    }
}

/// All pending state of one storage server.
#[derive(Default)]
pub struct ServerPending {
    pub parity_update: PendingMap<DeferredUpdate, PeerAddr>,
    pub parity_delete: PendingMap<DeferredDelete, PeerAddr>,
    pub jobs: JobTable,
    pub batches: BatchTable,
}

impl ServerPending {
    pub fn new() -> Self {
        Self::default()
    }
}
