//! Degraded-lock service
//!
//! Grants at most one gateway per chunk the right to drive reconstruction.
//! The first lock on a chunk wins and fixes the reconstruction mapping;
//! every later request gets `WasLocked` with the winning mapping, so all
//! gateways converge on the same replacement slot. Relocations registered
//! for keys written during a failure short-circuit to `Remapped`.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::directory::KeyDirectory;
use proto::{DegradedLockResult, MessageId, ReconstructionMapping};
use sk_core::{Key, Metadata, ServerId, StripeMap};

#[derive(Debug, Clone)]
struct LockRecord {
    holder: MessageId,
    mapping: ReconstructionMapping,
    sealed: bool,
}

#[derive(Default)]
pub struct DegradedLockService {
    /// chunk -> the lock that owns its reconstruction
    locks: Mutex<BTreeMap<Metadata, LockRecord>>,
    /// keys relocated by a SET that hit a down slot
    remapped: Mutex<HashMap<Key, (u32, u32)>>,
}

impl DegradedLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a degraded lock request against the directory.
    pub fn lock(
        &self,
        key: &Key,
        proposed: ReconstructionMapping,
        holder: MessageId,
        directory: &KeyDirectory,
    ) -> DegradedLockResult {
        if let Some(&remapped) = self.remapped.lock().get(key) {
            return DegradedLockResult::Remapped { remapped };
        }
        let Some(metadata) = directory.lookup(key) else {
            return DegradedLockResult::NotExist;
        };

        let mut locks = self.locks.lock();
        match locks.get(&metadata) {
            Some(record) => DegradedLockResult::WasLocked {
                stripe_id: metadata.stripe_id,
                mapping: record.mapping.clone(),
                sealed: record.sealed,
            },
            None => {
                let sealed = directory.is_sealed(&metadata);
                locks.insert(
                    metadata,
                    LockRecord {
                        holder,
                        mapping: proposed.clone(),
                        sealed,
                    },
                );
                info!(
                    %metadata,
                    instance_id = holder.instance_id,
                    request_id = holder.request_id,
                    "degraded lock granted"
                );
                DegradedLockResult::IsLocked {
                    stripe_id: metadata.stripe_id,
                    mapping: proposed,
                    sealed,
                }
            }
        }
    }

    /// Register a relocation for a key written while its slot is down.
    /// Returns the authoritative slot; an earlier registration wins.
    pub fn remap_lock(&self, key: Key, proposed: (u32, u32)) -> (u32, u32) {
        *self.remapped.lock().entry(key).or_insert(proposed)
    }

    pub fn remapped_slot(&self, key: &Key) -> Option<(u32, u32)> {
        self.remapped.lock().get(key).copied()
    }

    /// Drop lock records once their chunks are reconstructed.
    pub fn release(&self, chunks: &[Metadata]) -> u32 {
        let mut locks = self.locks.lock();
        let mut released = 0;
        for metadata in chunks {
            if locks.remove(metadata).is_some() {
                released += 1;
                debug!(%metadata, "degraded lock released");
            }
        }
        released
    }

    /// Drop every lock parked on a chunk the recovered server owns. The
    /// outage is over, so whatever was left mid-reconstruction is stale.
    pub fn release_server(&self, server: ServerId, stripe_map: &StripeMap) -> u32 {
        let mut locks = self.locks.lock();
        let stale: Vec<Metadata> = locks
            .keys()
            .filter(|m| stripe_map.resolve_chunk(m.list_id, m.chunk_id) == Some(server))
            .copied()
            .collect();
        for metadata in &stale {
            locks.remove(metadata);
            debug!(%metadata, server, "stale degraded lock dropped");
        }
        stale.len() as u32
    }

    pub fn is_locked(&self, metadata: &Metadata) -> bool {
        self.locks.lock().contains_key(metadata)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}
