//! Cauchy Reed-Solomon coding over GF(2^8)
//!
//! The matrix math lives in `reed-solomon-erasure`; this wrapper only
//! adapts the shard-vector call contract and maps error cases.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::{check_present, CodingEngine, CodingError};

pub struct CauchyCoding {
    k: usize,
    m: usize,
    rs: ReedSolomon,
}

impl CauchyCoding {
    pub fn new(k: usize, m: usize) -> Result<Self, CodingError> {
        let rs = ReedSolomon::new(k, m)
            .map_err(|e| CodingError::BadParameters(format!("reed-solomon: {:?}", e)))?;
        Ok(Self { k, m, rs })
    }
}

impl CodingEngine for CauchyCoding {
    fn k(&self) -> usize {
        self.k
    }

    fn m(&self) -> usize {
        self.m
    }

    fn encode(&self, data: &[Vec<u8>], parity_index: usize) -> Result<Vec<u8>, CodingError> {
        if parity_index >= self.m {
            return Err(CodingError::BadParityIndex(parity_index));
        }
        Ok(self.encode_all(data)?.swap_remove(parity_index))
    }

    fn encode_all(&self, data: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, CodingError> {
        if data.len() != self.k {
            return Err(CodingError::BadParameters(format!(
                "expected {} data shards, got {}",
                self.k,
                data.len()
            )));
        }
        let len = data[0].len();
        if data.iter().any(|d| d.len() != len) {
            return Err(CodingError::ShardLengthMismatch);
        }
        let mut shards: Vec<Vec<u8>> = data.to_vec();
        shards.extend((0..self.m).map(|_| vec![0u8; len]));
        self.rs
            .encode(&mut shards)
            .map_err(|_| CodingError::ShardLengthMismatch)?;
        Ok(shards.split_off(self.k))
    }

    fn decode(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), CodingError> {
        if shards.len() != self.k + self.m {
            return Err(CodingError::BadParameters(format!(
                "expected {} shards, got {}",
                self.k + self.m,
                shards.len()
            )));
        }
        check_present(shards, self.k)?;
        self.rs
            .reconstruct(shards)
            .map_err(|_| CodingError::ShardLengthMismatch)
    }
}
