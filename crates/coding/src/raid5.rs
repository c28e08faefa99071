//! Single-parity XOR coding (RAID5-style, m = 1)

use crate::{check_present, CodingEngine, CodingError};

/// Word-wise XOR of `a` and `b` into `dst`. All slices must have the same
/// length; the tail shorter than a word is XOR-ed byte by byte.
pub fn bitwise_xor(dst: &mut [u8], a: &[u8], b: &[u8]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(dst.len(), a.len());
    let words = dst.len() / 8;
    for i in 0..words {
        let off = i * 8;
        let wa = u64::from_ne_bytes(a[off..off + 8].try_into().unwrap());
        let wb = u64::from_ne_bytes(b[off..off + 8].try_into().unwrap());
        dst[off..off + 8].copy_from_slice(&(wa ^ wb).to_ne_bytes());
    }
    for i in words * 8..dst.len() {
        dst[i] = a[i] ^ b[i];
    }
}

/// XOR `src` into `dst` in place.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let words = dst.len() / 8;
    for i in 0..words {
        let off = i * 8;
        let wd = u64::from_ne_bytes(dst[off..off + 8].try_into().unwrap());
        let ws = u64::from_ne_bytes(src[off..off + 8].try_into().unwrap());
        dst[off..off + 8].copy_from_slice(&(wd ^ ws).to_ne_bytes());
    }
    for i in words * 8..dst.len() {
        dst[i] ^= src[i];
    }
}

pub struct Raid5Coding {
    k: usize,
}

impl Raid5Coding {
    pub fn new(k: usize) -> Result<Self, CodingError> {
        if k < 2 {
            return Err(CodingError::BadParameters(format!(
                "RAID5 requires k >= 2, got {}",
                k
            )));
        }
        Ok(Self { k })
    }
}

impl CodingEngine for Raid5Coding {
    fn k(&self) -> usize {
        self.k
    }

    fn m(&self) -> usize {
        1
    }

    fn encode(&self, data: &[Vec<u8>], parity_index: usize) -> Result<Vec<u8>, CodingError> {
        if parity_index != 0 {
            return Err(CodingError::BadParityIndex(parity_index));
        }
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
        let mut parity = data[0].clone();
        for shard in &data[1..] {
            xor_into(&mut parity, shard);
        }
        Ok(parity)
    }

    fn decode(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), CodingError> {
        if shards.len() != self.k + 1 {
            return Err(CodingError::BadParameters(format!(
                "expected {} shards, got {}",
                self.k + 1,
                shards.len()
            )));
        }
        check_present(shards, self.k)?;

        let missing: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        let Some(&target) = missing.first() else {
            return Ok(());
        };

        let len = shards
            .iter()
            .flatten()
            .map(|s| s.len())
            .next()
            .ok_or(CodingError::ShardLengthMismatch)?;
        if shards.iter().flatten().any(|s| s.len() != len) {
            return Err(CodingError::ShardLengthMismatch);
        }

        // The missing shard is the XOR of all survivors, data and parity
        // alike.
        let mut out = vec![0u8; len];
        for shard in shards.iter().flatten() {
            xor_into(&mut out, shard);
        }
        shards[target] = Some(out);
        Ok(())
    }
}
