//! Active (unsealed) chunk buffers
//!
//! One buffer per (list, chunk slot) pair. The data slot this server owns
//! and the mirror copies it keeps for parity maintenance all go through
//! the same store; a buffer seals when the next record no longer fits,
//! yielding the full chunk and opening a fresh one for the next stripe.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sk_core::{Chunk, ChunkPool, KeyValue, Metadata};

struct ActiveBuffer {
    stripe_id: u32,
    chunk: Chunk,
}

/// Result of appending a record to an active buffer.
pub struct AppendOutcome {
    /// Where the record landed
    pub location: Metadata,
    /// Record offset inside the chunk
    pub offset: u32,
    /// Chunk sealed by this append, when the record overflowed it
    pub sealed: Option<(Metadata, Chunk)>,
}

pub struct ChunkBufferStore {
    pool: Arc<ChunkPool>,
    buffers: Mutex<HashMap<(u32, u32), ActiveBuffer>>,
}

impl ChunkBufferStore {
    pub fn new(pool: Arc<ChunkPool>) -> Self {
        Self {
            pool,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a record to the active buffer of (list, chunk slot). An
    /// overflowing record seals the current chunk and starts the next
    /// stripe. Returns None only when the record exceeds chunk capacity
    /// outright.
    pub fn append(&self, list_id: u32, chunk_id: u32, kv: &KeyValue) -> Option<AppendOutcome> {
        if kv.serialized_size() > self.pool.chunk_capacity() {
            return None;
        }
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry((list_id, chunk_id)).or_insert_with(|| ActiveBuffer {
            stripe_id: 0,
            chunk: self.pool.acquire(),
        });

        let mut sealed = None;
        let offset = match buffer.chunk.append(kv) {
            Some(offset) => offset,
            None => {
                let full = std::mem::replace(&mut buffer.chunk, self.pool.acquire());
                sealed = Some((
                    Metadata::new(list_id, buffer.stripe_id, chunk_id),
                    full,
                ));
                buffer.stripe_id += 1;
                buffer.chunk.append(kv)?
            }
        };
        Some(AppendOutcome {
            location: Metadata::new(list_id, buffer.stripe_id, chunk_id),
            offset,
            sealed,
        })
    }

    /// Run `f` against the active chunk at `metadata`, if the buffer's
    /// current stripe matches.
    pub fn with_active<R>(
        &self,
        metadata: &Metadata,
        f: impl FnOnce(&mut Chunk) -> R,
    ) -> Option<R> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.get_mut(&(metadata.list_id, metadata.chunk_id))?;
        if buffer.stripe_id != metadata.stripe_id {
            return None;
        }
        Some(f(&mut buffer.chunk))
    }

    /// Copy of the active chunk at `metadata`, if any.
    pub fn snapshot(&self, metadata: &Metadata) -> Option<Chunk> {
        self.with_active(metadata, |chunk| chunk.clone())
    }

    /// Seal the active buffer of (list, chunk slot) right now, returning
    /// the chunk and its metadata. Used when a degraded stripe must be
    /// coded before its chunks filled naturally.
    pub fn seal_now(&self, list_id: u32, chunk_id: u32) -> Option<(Metadata, Chunk)> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.get_mut(&(list_id, chunk_id))?;
        if buffer.chunk.count() == 0 {
            return None;
        }
        let full = std::mem::replace(&mut buffer.chunk, self.pool.acquire());
        let metadata = Metadata::new(list_id, buffer.stripe_id, chunk_id);
        buffer.stripe_id += 1;
        Some((metadata, full))
    }

    pub fn current_stripe(&self, list_id: u32, chunk_id: u32) -> u32 {
        self.buffers
            .lock()
            .get(&(list_id, chunk_id))
            .map(|b| b.stripe_id)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sk_core::Key;

    fn store(capacity: usize) -> ChunkBufferStore {
        ChunkBufferStore::new(Arc::new(ChunkPool::new(capacity, 4)))
    }

    fn kv(key: &str, value: &[u8]) -> KeyValue {
        KeyValue::new(Key::from(key), Bytes::copy_from_slice(value))
    }

    #[test]
    fn test_append_advances_stripe_on_overflow() {
        let store = store(32);
        let first = store.append(0, 1, &kv("aa", &[1u8; 16])).unwrap();
        assert_eq!(first.location, Metadata::new(0, 0, 1));
        assert!(first.sealed.is_none());

        let second = store.append(0, 1, &kv("bb", &[2u8; 16])).unwrap();
        assert_eq!(second.location, Metadata::new(0, 1, 1));
        let (sealed_meta, sealed_chunk) = second.sealed.unwrap();
        assert_eq!(sealed_meta, Metadata::new(0, 0, 1));
        assert_eq!(sealed_chunk.count(), 1);
    }

    #[test]
    fn test_with_active_requires_current_stripe() {
        let store = store(256);
        let outcome = store.append(2, 0, &kv("k", b"v")).unwrap();
        assert!(store
            .with_active(&outcome.location, |c| c.count())
            .is_some());
        let stale = Metadata::new(2, outcome.location.stripe_id + 1, 0);
        assert!(store.with_active(&stale, |c| c.count()).is_none());
    }

    #[test]
    fn test_seal_now_skips_empty_buffers() {
        let store = store(64);
        assert!(store.seal_now(0, 0).is_none());
        store.append(0, 0, &kv("k", b"v")).unwrap();
        let (metadata, chunk) = store.seal_now(0, 0).unwrap();
        assert_eq!(metadata, Metadata::new(0, 0, 0));
        assert_eq!(chunk.count(), 1);
        assert_eq!(store.current_stripe(0, 0), 1);
    }
}
