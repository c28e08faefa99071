//! Fixed-capacity chunks and the reusing chunk pool
//!
//! A chunk is the atomic unit of erasure coding: a fixed-capacity byte
//! buffer holding concatenated serialized key-value records. Capacity is
//! set once, process-wide. Chunks are allocated from a pool at startup and
//! reused (cleared, never resized) when released.

use parking_lot::Mutex;

use crate::key_value::KeyValue;

/// Fixed-capacity record buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    data: Vec<u8>,
    count: u32,
    size: u32,
}

impl Chunk {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            count: 0,
            size: 0,
        }
    }

    /// Build a chunk directly from raw bytes (e.g. a decoded shard).
    pub fn from_bytes(data: Vec<u8>, count: u32, size: u32) -> Self {
        Self { data, count, size }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of records stored
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Bytes used
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.size as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Append a record; returns the record's offset, or None when full.
    pub fn append(&mut self, kv: &KeyValue) -> Option<u32> {
        let len = kv.serialized_size();
        if len > self.remaining() {
            return None;
        }
        let offset = self.size as usize;
        kv.write_to(&mut self.data[offset..offset + len]);
        self.count += 1;
        self.size += len as u32;
        Some(offset as u32)
    }

    /// Read the record stored at `offset`.
    pub fn get_key_value(&self, offset: u32) -> Option<KeyValue> {
        KeyValue::parse_at(&self.data[..self.size as usize], offset as usize)
            .map(|(kv, _)| kv)
    }

    /// Overwrite part of a record's value in place. `value_offset` is the
    /// offset within the value of the record at `record_offset`.
    pub fn update_value(
        &mut self,
        record_offset: u32,
        key_size: usize,
        value_offset: u32,
        delta: &[u8],
    ) -> bool {
        let start = record_offset as usize
            + crate::key_value::RECORD_HEADER_SIZE
            + key_size
            + value_offset as usize;
        let end = start + delta.len();
        if end > self.size as usize {
            return false;
        }
        self.data[start..end].copy_from_slice(delta);
        true
    }

    /// Iterate all records in the chunk.
    pub fn records(&self) -> Vec<(u32, KeyValue)> {
        let mut out = Vec::with_capacity(self.count as usize);
        let mut offset = 0usize;
        while offset < self.size as usize {
            match KeyValue::parse_at(&self.data[..self.size as usize], offset) {
                Some((kv, len)) => {
                    out.push((offset as u32, kv));
                    offset += len;
                }
                None => break,
            }
        }
        out
    }

    /// Reset for reuse; keeps the allocation.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.count = 0;
        self.size = 0;
    }
}

/// Pool of pre-allocated chunks, refilled on release.
pub struct ChunkPool {
    capacity: usize,
    free: Mutex<Vec<Chunk>>,
}

impl ChunkPool {
    pub fn new(chunk_capacity: usize, chunk_count: usize) -> Self {
        let free = (0..chunk_count).map(|_| Chunk::new(chunk_capacity)).collect();
        Self {
            capacity: chunk_capacity,
            free: Mutex::new(free),
        }
    }

    pub fn chunk_capacity(&self) -> usize {
        self.capacity
    }

    /// Take a chunk from the pool; falls back to a fresh allocation when
    /// the pool is exhausted so steady-state traffic never fails here.
    pub fn acquire(&self) -> Chunk {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Chunk::new(self.capacity))
    }

    pub fn release(&self, mut chunk: Chunk) {
        chunk.clear();
        self.free.lock().push(chunk);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_value::Key;
    use bytes::Bytes;

    fn kv(key: &str, value: &[u8]) -> KeyValue {
        KeyValue::new(Key::from(key), Bytes::copy_from_slice(value))
    }

    #[test]
    fn test_append_and_read_back() {
        let mut chunk = Chunk::new(256);
        let a = kv("alpha", b"11111");
        let b = kv("beta", b"2222");
        let off_a = chunk.append(&a).unwrap();
        let off_b = chunk.append(&b).unwrap();
        assert_eq!(chunk.count(), 2);
        assert_eq!(chunk.get_key_value(off_a).unwrap(), a);
        assert_eq!(chunk.get_key_value(off_b).unwrap(), b);
    }

    #[test]
    fn test_append_rejects_when_full() {
        let mut chunk = Chunk::new(16);
        let big = kv("key", &[0u8; 64]);
        assert!(chunk.append(&big).is_none());
        assert_eq!(chunk.count(), 0);
    }

    #[test]
    fn test_update_value_in_place() {
        let mut chunk = Chunk::new(128);
        let rec = kv("k1", b"abcdef");
        let off = chunk.append(&rec).unwrap();
        assert!(chunk.update_value(off, 2, 2, b"XY"));
        let got = chunk.get_key_value(off).unwrap();
        assert_eq!(&got.value[..], b"abXYef");
    }

    #[test]
    fn test_pool_reuse_clears_chunk() {
        let pool = ChunkPool::new(64, 1);
        let mut chunk = pool.acquire();
        chunk.append(&kv("x", b"y")).unwrap();
        pool.release(chunk);
        let again = pool.acquire();
        assert_eq!(again.count(), 0);
        assert_eq!(again.size(), 0);
        assert!(again.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_records_iteration() {
        let mut chunk = Chunk::new(256);
        let recs = vec![kv("a", b"1"), kv("bb", b"22"), kv("ccc", b"333")];
        for r in &recs {
            chunk.append(r).unwrap();
        }
        let listed: Vec<KeyValue> = chunk.records().into_iter().map(|(_, kv)| kv).collect();
        assert_eq!(listed, recs);
    }
}
