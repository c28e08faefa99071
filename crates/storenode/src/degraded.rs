//! Per-key degraded operation queues and the reconstructed chunk cache
//!
//! While a key's chunk is being reconstructed, every further degraded
//! operation on that key queues behind the first one instead of starting
//! a second fan-out. The finished chunk is cached so later degraded
//! operations on the same chunk are served locally until the lock is
//! released.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use coding::SealState;
use proto::{MessageId, PeerAddr};
use sk_core::{Chunk, Key, Metadata};

/// What a queued degraded operation wants done once the chunk exists.
#[derive(Debug, Clone)]
pub enum DegradedOp {
    Get,
    Update { offset: u32, data: Bytes },
    Delete,
}

/// A degraded request parked until reconstruction finishes.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub from: PeerAddr,
    pub id: MessageId,
    pub key: Key,
    pub op: DegradedOp,
}

/// Whether an arriving degraded request starts reconstruction or joins
/// one already in flight.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Trigger,
    Queued,
}

#[derive(Default)]
pub struct DegradedChunkDirectory {
    waiters: Mutex<HashMap<Key, Vec<Waiter>>>,
    chunks: Mutex<HashMap<Metadata, (SealState, Chunk)>>,
    /// Reconstructed values by key; answers repeat degraded GETs without
    /// rescanning the chunk. Invalidated by degraded UPDATE/DELETE and
    /// evicted together with the owning chunk.
    values: Mutex<HashMap<Key, (Metadata, Bytes)>>,
}

impl DegradedChunkDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a degraded operation on `key`. The first waiter per key
    /// triggers reconstruction; the rest wait for its result.
    pub fn insert_degraded_key(&self, key: Key, waiter: Waiter) -> InsertOutcome {
        let mut waiters = self.waiters.lock();
        match waiters.get_mut(&key) {
            Some(queue) => {
                queue.push(waiter);
                InsertOutcome::Queued
            }
            None => {
                waiters.insert(key, vec![waiter]);
                InsertOutcome::Trigger
            }
        }
    }

    /// Drain every waiter for `key`; the queue disappears, so the next
    /// degraded request on this key triggers again.
    pub fn delete_degraded_key(&self, key: &Key) -> Vec<Waiter> {
        self.waiters.lock().remove(key).unwrap_or_default()
    }

    pub fn is_degraded(&self, key: &Key) -> bool {
        self.waiters.lock().contains_key(key)
    }

    pub fn insert_chunk(&self, metadata: Metadata, seal: SealState, chunk: Chunk) {
        self.chunks.lock().insert(metadata, (seal, chunk));
    }

    pub fn find_chunk(&self, metadata: &Metadata) -> Option<(SealState, Chunk)> {
        self.chunks.lock().get(metadata).cloned()
    }

    /// Mutate a cached reconstructed chunk in place.
    pub fn with_chunk_mut<R>(
        &self,
        metadata: &Metadata,
        f: impl FnOnce(&mut Chunk) -> R,
    ) -> Option<R> {
        self.chunks.lock().get_mut(metadata).map(|(_, c)| f(c))
    }

    pub fn insert_value(&self, key: Key, metadata: Metadata, value: Bytes) {
        self.values.lock().insert(key, (metadata, value));
    }

    pub fn find_value(&self, key: &Key) -> Option<Bytes> {
        self.values.lock().get(key).map(|(_, v)| v.clone())
    }

    pub fn delete_value(&self, key: &Key) {
        self.values.lock().remove(key);
    }

    /// Drop every cached chunk named in a lock release, along with the
    /// cached values that came out of those chunks.
    pub fn evict_chunks(&self, released: &[Metadata]) -> Vec<(Metadata, SealState, Chunk)> {
        self.values
            .lock()
            .retain(|_, (m, _)| !released.contains(m));
        let mut chunks = self.chunks.lock();
        released
            .iter()
            .filter_map(|m| chunks.remove(m).map(|(s, c)| (*m, s, c)))
            .collect()
    }

    pub fn cached_chunks(&self) -> Vec<Metadata> {
        self.chunks.lock().keys().copied().collect()
    }

    pub fn cached_chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(key: &Key, request_id: u32) -> Waiter {
        Waiter {
            from: PeerAddr::Gateway(1),
            id: MessageId::new(1, request_id),
            key: key.clone(),
            op: DegradedOp::Get,
        }
    }

    #[test]
    fn test_first_waiter_triggers_rest_queue() {
        let dir = DegradedChunkDirectory::new();
        let key = Key::from("k");
        assert_eq!(
            dir.insert_degraded_key(key.clone(), waiter(&key, 1)),
            InsertOutcome::Trigger
        );
        assert_eq!(
            dir.insert_degraded_key(key.clone(), waiter(&key, 2)),
            InsertOutcome::Queued
        );
        assert!(dir.is_degraded(&key));

        let drained = dir.delete_degraded_key(&key);
        assert_eq!(drained.len(), 2);
        assert!(!dir.is_degraded(&key));

        // Queue is gone, so the next arrival triggers again.
        assert_eq!(
            dir.insert_degraded_key(key.clone(), waiter(&key, 3)),
            InsertOutcome::Trigger
        );
    }

    #[test]
    fn test_value_cache_follows_chunk_lifetime() {
        let dir = DegradedChunkDirectory::new();
        let key = Key::from("cached");
        let metadata = Metadata::new(0, 2, 1);
        dir.insert_chunk(metadata, SealState::Sealed, Chunk::new(16));
        dir.insert_value(key.clone(), metadata, Bytes::from_static(b"value"));
        assert_eq!(dir.find_value(&key), Some(Bytes::from_static(b"value")));

        // A mutation on the key drops only that value.
        dir.delete_value(&key);
        assert_eq!(dir.find_value(&key), None);

        // Values die with their chunk on lock release.
        dir.insert_value(key.clone(), metadata, Bytes::from_static(b"value"));
        dir.evict_chunks(&[metadata]);
        assert_eq!(dir.find_value(&key), None);
    }

    #[test]
    fn test_chunk_cache_eviction() {
        let dir = DegradedChunkDirectory::new();
        let m1 = Metadata::new(0, 0, 1);
        let m2 = Metadata::new(0, 1, 1);
        dir.insert_chunk(m1, SealState::Sealed, Chunk::new(16));
        dir.insert_chunk(m2, SealState::Unsealed, Chunk::new(16));
        assert!(dir.find_chunk(&m1).is_some());

        let evicted = dir.evict_chunks(&[m1]);
        assert_eq!(evicted.len(), 1);
        assert!(dir.find_chunk(&m1).is_none());
        assert_eq!(dir.cached_chunk_count(), 1);
    }
}
