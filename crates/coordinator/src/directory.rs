//! Global key and chunk directory
//!
//! Fed asynchronously by server heartbeats; authoritative enough for the
//! degraded-lock service to answer `NotExist` and to report whether a
//! chunk was sealed at failure time. A heartbeat carries sealed-chunk
//! announcements plus a batch of key operations since the previous beat.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use proto::{HEARTBEAT_OP_DELETE, HEARTBEAT_OP_SET};
use sk_core::{Key, Metadata, ServerId};

#[derive(Default)]
pub struct KeyDirectory {
    /// key -> its chunk slot, as last reported
    keys: RwLock<HashMap<Key, Metadata>>,
    /// chunks announced sealed, ordered so one stripe list range-scans
    sealed: RwLock<BTreeSet<Metadata>>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one heartbeat batch from a server.
    pub fn apply_heartbeat(
        &self,
        server: ServerId,
        sealed: Vec<Metadata>,
        keys: Vec<(Key, Metadata, u8)>,
    ) {
        if !sealed.is_empty() {
            let mut set = self.sealed.write();
            for metadata in sealed {
                set.insert(metadata);
            }
        }
        if !keys.is_empty() {
            let mut map = self.keys.write();
            for (key, metadata, op) in keys {
                match op {
                    HEARTBEAT_OP_SET => {
                        map.insert(key, metadata);
                    }
                    HEARTBEAT_OP_DELETE => {
                        map.remove(&key);
                    }
                    other => {
                        debug!(server, op = other, "unknown heartbeat op ignored");
                    }
                }
            }
        }
    }

    pub fn lookup(&self, key: &Key) -> Option<Metadata> {
        self.keys.read().get(key).copied()
    }

    pub fn is_sealed(&self, metadata: &Metadata) -> bool {
        self.sealed.read().contains(metadata)
    }

    /// Stripe ids with a sealed chunk in the given list. These are the
    /// stripes a failed slot of that list must reconstruct.
    pub fn sealed_stripes_of_list(&self, list_id: u32) -> Vec<u32> {
        let set = self.sealed.read();
        let lo = Metadata::new(list_id, 0, 0);
        let hi = Metadata::new(list_id + 1, 0, 0);
        let mut stripes: Vec<u32> = set.range(lo..hi).map(|m| m.stripe_id).collect();
        stripes.dedup();
        stripes
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::from(s)
    }

    #[test]
    fn test_heartbeat_set_then_delete() {
        let dir = KeyDirectory::new();
        let m = Metadata::new(1, 0, 2);
        dir.apply_heartbeat(0, vec![], vec![(key("a"), m, HEARTBEAT_OP_SET)]);
        assert_eq!(dir.lookup(&key("a")), Some(m));

        dir.apply_heartbeat(0, vec![], vec![(key("a"), m, HEARTBEAT_OP_DELETE)]);
        assert_eq!(dir.lookup(&key("a")), None);
    }

    #[test]
    fn test_sealed_stripes_scoped_to_list() {
        let dir = KeyDirectory::new();
        dir.apply_heartbeat(
            0,
            vec![
                Metadata::new(3, 0, 1),
                Metadata::new(3, 2, 0),
                Metadata::new(3, 2, 1),
                Metadata::new(4, 7, 0),
            ],
            vec![],
        );
        assert_eq!(dir.sealed_stripes_of_list(3), vec![0, 2]);
        assert_eq!(dir.sealed_stripes_of_list(4), vec![7]);
        assert!(dir.sealed_stripes_of_list(5).is_empty());
        assert!(dir.is_sealed(&Metadata::new(3, 2, 0)));
        assert!(!dir.is_sealed(&Metadata::new(3, 1, 0)));
    }
}
