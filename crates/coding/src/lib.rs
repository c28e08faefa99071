//! Erasure coding engines
//!
//! Stateless per call: `encode` derives parity shards from the k data
//! shards, `decode` reconstructs any missing shards from at least k
//! survivors. Two schemes are provided: single-parity XOR (RAID5-style)
//! and Cauchy Reed-Solomon over GF(2^8).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cauchy;
pub mod raid5;
pub mod seal;

pub use cauchy::CauchyCoding;
pub use raid5::{bitwise_xor, Raid5Coding};
pub use seal::{force_seal, merge_seal_states, SealState};

#[derive(Debug, Error)]
pub enum CodingError {
    #[error("fewer than k shards present ({present} of {required} required)")]
    InsufficientShards { present: usize, required: usize },
    #[error("shard length mismatch")]
    ShardLengthMismatch,
    #[error("parity index {0} out of range")]
    BadParityIndex(usize),
    #[error("invalid coding parameters: {0}")]
    BadParameters(String),
}

/// Configured coding scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Raid5,
    Cauchy,
}

/// Stateless encode/decode over equal-length shards.
///
/// A shard vector always has k+m entries: indices `0..k` are data shards,
/// `k..k+m` parity shards.
pub trait CodingEngine: Send + Sync {
    fn k(&self) -> usize;
    fn m(&self) -> usize;

    /// Compute the parity shard at `parity_index` (0-based within the m
    /// parity slots) from the k data shards.
    fn encode(&self, data: &[Vec<u8>], parity_index: usize) -> Result<Vec<u8>, CodingError>;

    /// Reconstruct every `None` entry in place. Requires at least k of the
    /// k+m entries present.
    fn decode(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), CodingError>;

    /// All m parity shards at once.
    fn encode_all(&self, data: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, CodingError> {
        (0..self.m()).map(|i| self.encode(data, i)).collect()
    }
}

/// Instantiate an engine for the configured scheme.
pub fn new_engine(scheme: Scheme, k: usize, m: usize) -> Result<Arc<dyn CodingEngine>, CodingError> {
    match scheme {
        Scheme::Raid5 => Ok(Arc::new(Raid5Coding::new(k)?)),
        Scheme::Cauchy => Ok(Arc::new(CauchyCoding::new(k, m)?)),
    }
}

pub(crate) fn check_present(shards: &[Option<Vec<u8>>], k: usize) -> Result<(), CodingError> {
    let present = shards.iter().filter(|s| s.is_some()).count();
    if present < k {
        return Err(CodingError::InsufficientShards {
            present,
            required: k,
        });
    }
    Ok(())
}
