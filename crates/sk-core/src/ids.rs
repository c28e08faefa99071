//! Identifiers and id generation
//!
//! Request ids are generated per worker so that two workers never hand out
//! the same id: worker `w` of `n` produces the sequence `w, w+n, w+2n, ...`.
//! Instance ids identify a connection/session generation, so a reconnected
//! peer starts a fresh id space instead of colliding with stale entries.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Logical connection/session generation id
pub type InstanceId = u16;
/// Per-worker monotonic request counter
pub type RequestId = u32;
/// Storage server identity (slot in the registered server list)
pub type ServerId = u16;

/// Strongly-typed connection handle: arena index plus a generation counter.
///
/// Replaces raw socket-pointer identity; a reused slot gets a bumped
/// generation, so a late response can never be routed to the wrong
/// connection occupying the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnHandle {
    pub index: u32,
    pub generation: u32,
}

impl ConnHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl std::fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

/// Per-worker request id generator
pub struct IdGenerator {
    workers: u32,
    counters: Vec<AtomicU32>,
}

impl IdGenerator {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "at least one worker required");
        Self {
            workers: workers as u32,
            counters: (0..workers).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Next request id for the given worker; disjoint across workers.
    pub fn next(&self, worker_id: usize) -> RequestId {
        let n = self.counters[worker_id].fetch_add(1, Ordering::Relaxed);
        n.wrapping_mul(self.workers)
            .wrapping_add(worker_id as u32)
    }
}

/// Wrapping 32-bit timestamp counter, one per outbound server connection.
#[derive(Default)]
pub struct TimestampGenerator {
    current: AtomicU32,
}

impl TimestampGenerator {
    pub fn next(&self) -> u32 {
        self.current.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_disjoint_across_workers() {
        let gen = IdGenerator::new(4);
        let mut seen = HashSet::new();
        for w in 0..4 {
            for _ in 0..256 {
                assert!(seen.insert(gen.next(w)));
            }
        }
    }

    #[test]
    fn test_conn_handle_generation_distinguishes_reuse() {
        let a = ConnHandle::new(3, 1);
        let b = ConnHandle::new(3, 2);
        assert_ne!(a, b);
        assert_eq!(a, ConnHandle::new(3, 1));
    }
}
