//! Key index, sealed chunk cache and the heartbeat journal
//!
//! The key index maps each record owned by this server (as the data slot)
//! to its chunk slot and in-chunk offset. Sealed chunks live in an
//! ordered cache keyed by `Metadata`; mirror copies of other slots'
//! sealed chunks share the same cache, distinguished only by their seal
//! state. Every index mutation is journaled for the next heartbeat.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};

use coding::SealState;
use proto::{HEARTBEAT_OP_DELETE, HEARTBEAT_OP_SET};
use sk_core::{Chunk, Key, Metadata};

/// Where a record lives: its chunk and record offset inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMetadata {
    pub metadata: Metadata,
    pub offset: u32,
}

/// A sealed chunk held by this server.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub seal: SealState,
    pub chunk: Chunk,
}

#[derive(Default)]
pub struct Map {
    keys: RwLock<std::collections::HashMap<Key, KeyMetadata>>,
    cache: RwLock<BTreeMap<Metadata, SealedChunk>>,
    /// (key, location, op) tuples not yet reported to the coordinator
    journal_keys: Mutex<Vec<(Key, Metadata, u8)>>,
    /// sealed chunks not yet announced
    journal_sealed: Mutex<Vec<Metadata>>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_key(&self, key: Key, location: KeyMetadata) {
        self.keys.write().insert(key.clone(), location);
        self.journal_keys
            .lock()
            .push((key, location.metadata, HEARTBEAT_OP_SET));
    }

    pub fn remove_key(&self, key: &Key) -> Option<KeyMetadata> {
        let removed = self.keys.write().remove(key);
        if let Some(location) = removed {
            self.journal_keys
                .lock()
                .push((key.clone(), location.metadata, HEARTBEAT_OP_DELETE));
        }
        removed
    }

    pub fn lookup(&self, key: &Key) -> Option<KeyMetadata> {
        self.keys.read().get(key).copied()
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    /// Store a sealed chunk. The owning data slot announces it; mirror
    /// copies (SealPending until the authoritative seal arrives) do not.
    pub fn insert_sealed(&self, metadata: Metadata, sealed: SealedChunk, announce: bool) {
        self.cache.write().insert(metadata, sealed);
        if announce {
            self.journal_sealed.lock().push(metadata);
        }
    }

    pub fn find_sealed(&self, metadata: &Metadata) -> Option<SealedChunk> {
        self.cache.read().get(metadata).cloned()
    }

    /// Run `f` against a sealed chunk in place.
    pub fn with_sealed_mut<R>(
        &self,
        metadata: &Metadata,
        f: impl FnOnce(&mut SealedChunk) -> R,
    ) -> Option<R> {
        self.cache.write().get_mut(metadata).map(f)
    }

    /// All sealed chunks of one stripe (any slot).
    pub fn sealed_of_stripe(&self, list_id: u32, stripe_id: u32) -> Vec<(Metadata, SealedChunk)> {
        let lo = Metadata::new(list_id, stripe_id, 0);
        let hi = Metadata::new(list_id, stripe_id + 1, 0);
        self.cache
            .read()
            .range(lo..hi)
            .map(|(m, c)| (*m, c.clone()))
            .collect()
    }

    /// Drain the journal for one heartbeat.
    pub fn drain_journal(&self) -> (Vec<Metadata>, Vec<(Key, Metadata, u8)>) {
        (
            std::mem::take(&mut *self.journal_sealed.lock()),
            std::mem::take(&mut *self.journal_keys.lock()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sk_core::KeyValue;

    #[test]
    fn test_key_index_journal() {
        let map = Map::new();
        let key = Key::from("a");
        let location = KeyMetadata {
            metadata: Metadata::new(0, 1, 2),
            offset: 16,
        };
        map.insert_key(key.clone(), location);
        assert_eq!(map.lookup(&key), Some(location));

        map.remove_key(&key);
        assert_eq!(map.lookup(&key), None);

        let (sealed, keys) = map.drain_journal();
        assert!(sealed.is_empty());
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].2, HEARTBEAT_OP_SET);
        assert_eq!(keys[1].2, HEARTBEAT_OP_DELETE);
        // Journal drains once.
        assert!(map.drain_journal().1.is_empty());
    }

    #[test]
    fn test_sealed_cache_announcement() {
        let map = Map::new();
        let mut chunk = Chunk::new(64);
        chunk
            .append(&KeyValue::new(Key::from("k"), Bytes::from_static(b"v")))
            .unwrap();
        let owned = Metadata::new(0, 0, 1);
        let mirrored = Metadata::new(0, 0, 2);
        map.insert_sealed(
            owned,
            SealedChunk {
                seal: SealState::Sealed,
                chunk: chunk.clone(),
            },
            true,
        );
        map.insert_sealed(
            mirrored,
            SealedChunk {
                seal: SealState::SealPending,
                chunk,
            },
            false,
        );

        let (sealed, _) = map.drain_journal();
        assert_eq!(sealed, vec![owned]);
        assert_eq!(map.sealed_of_stripe(0, 0).len(), 2);
        assert!(map.sealed_of_stripe(0, 1).is_empty());
    }
}
