//! Chunk slot identity

use serde::{Deserialize, Serialize};

/// Identifies exactly one physical chunk slot in the global stripe layout.
///
/// Ordering is lexicographic by (list, stripe, chunk) so a sorted map can
/// range-scan all chunks of one stripe list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Metadata {
    pub list_id: u32,
    pub stripe_id: u32,
    pub chunk_id: u32,
}

impl Metadata {
    pub fn new(list_id: u32, stripe_id: u32, chunk_id: u32) -> Self {
        Self {
            list_id,
            stripe_id,
            chunk_id,
        }
    }

    /// Same stripe, possibly different chunk slot.
    pub fn match_stripe(&self, other: &Metadata) -> bool {
        self.list_id == other.list_id && self.stripe_id == other.stripe_id
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.list_id, self.stripe_id, self.chunk_id)
    }
}
