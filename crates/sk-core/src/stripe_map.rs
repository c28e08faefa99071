//! Stripe map: key |-> stripe list |-> server slots
//!
//! A stripe list is a static assignment of k+m server slots (k data, m
//! parity). The map is deterministic and immutable after startup; node
//! failure never changes the mapping, only the liveness recorded in
//! [`crate::health::HealthMap`].

use serde::{Deserialize, Serialize};

use crate::ids::ServerId;

/// CRC16 (XMODEM variant)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Where a key lives: its stripe list and data chunk slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLocation {
    pub list_id: u32,
    pub chunk_id: u32,
}

/// Static stripe-list layout over the registered servers.
#[derive(Debug, Clone)]
pub struct StripeMap {
    k: usize,
    m: usize,
    /// lists[list_id][slot] = server; slots 0..k are data, k..k+m parity
    lists: Vec<Vec<ServerId>>,
}

impl StripeMap {
    /// Build `list_count` stripe lists by rotating the server ring.
    /// Requires `servers.len() >= k + m`.
    pub fn new(servers: &[ServerId], list_count: usize, k: usize, m: usize) -> Self {
        assert!(k >= 1 && m >= 1, "need at least one data and one parity slot");
        assert!(
            servers.len() >= k + m,
            "need at least k+m servers ({} < {})",
            servers.len(),
            k + m
        );
        let n = servers.len();
        let lists = (0..list_count)
            .map(|i| (0..k + m).map(|j| servers[(i + j) % n]).collect())
            .collect();
        Self { k, m, lists }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    /// Resolve a key to its stripe list and data chunk slot.
    pub fn resolve(&self, key: &[u8]) -> StripeLocation {
        let list_id = (crc16(key) as usize) % self.lists.len();
        // Different polynomial seed for the in-list slot so list and slot
        // selection are not correlated.
        let mut seeded = Vec::with_capacity(key.len() + 1);
        seeded.push(0x5au8);
        seeded.extend_from_slice(key);
        let chunk_id = (crc16(&seeded) as usize) % self.k;
        StripeLocation {
            list_id: list_id as u32,
            chunk_id: chunk_id as u32,
        }
    }

    /// Server occupying a chunk slot of a stripe list.
    pub fn resolve_chunk(&self, list_id: u32, chunk_id: u32) -> Option<ServerId> {
        self.lists
            .get(list_id as usize)
            .and_then(|l| l.get(chunk_id as usize))
            .copied()
    }

    /// All k+m servers of a stripe list, data slots first.
    pub fn servers_of(&self, list_id: u32) -> Option<&[ServerId]> {
        self.lists.get(list_id as usize).map(|l| l.as_slice())
    }

    /// Parity slots (chunk ids k..k+m) of a stripe list.
    pub fn parity_servers(&self, list_id: u32) -> Option<&[ServerId]> {
        self.lists.get(list_id as usize).map(|l| &l[self.k..])
    }

    /// All (list, chunk) slots a server participates in. Used on failure
    /// to enumerate every affected stripe list.
    pub fn reverse_lookup(&self, server: ServerId) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for (list_id, list) in self.lists.iter().enumerate() {
            for (chunk_id, s) in list.iter().enumerate() {
                if *s == server {
                    out.push((list_id as u32, chunk_id as u32));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> StripeMap {
        StripeMap::new(&[0, 1, 2, 3], 8, 3, 1)
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let m = map();
        let a = m.resolve(b"foo");
        assert_eq!(a, m.resolve(b"foo"));
        assert!((a.chunk_id as usize) < m.k());
        assert!((a.list_id as usize) < m.list_count());
    }

    #[test]
    fn test_slots_are_distinct_servers() {
        let m = map();
        for list_id in 0..m.list_count() as u32 {
            let servers = m.servers_of(list_id).unwrap();
            let mut sorted = servers.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), servers.len());
        }
    }

    #[test]
    fn test_reverse_lookup_covers_all_slots() {
        let m = map();
        let total: usize = (0..4).map(|s| m.reverse_lookup(s).len()).sum();
        assert_eq!(total, m.list_count() * (m.k() + m.m()));
        for (list_id, chunk_id) in m.reverse_lookup(2) {
            assert_eq!(m.resolve_chunk(list_id, chunk_id), Some(2));
        }
    }

    #[test]
    fn test_parity_slots_follow_data_slots() {
        let m = map();
        let all = m.servers_of(0).unwrap();
        let parity = m.parity_servers(0).unwrap();
        assert_eq!(parity, &all[3..]);
        assert_eq!(parity.len(), 1);
    }

    #[test]
    fn test_crc16_known_vector() {
        // XMODEM CRC16 of "123456789"
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }
}
